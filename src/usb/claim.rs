//! Process-wide ownership of devices and streaming endpoints.
//!
//! A [`Claim`] is an RAII guard: it is registered on acquire and released
//! when dropped, so an aborted open or a panicking task cannot leak it.

use std::collections::HashSet;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::debug;

static CLAIMS: Lazy<Mutex<HashSet<ClaimKey>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// What is being claimed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClaimKey {
    /// Stream controller ownership of a device.
    Device(String),
    /// Transfer scheduler ownership of one endpoint.
    Endpoint { device: String, address: u8 },
}

impl ClaimKey {
    pub fn device(device: impl Into<String>) -> Self {
        Self::Device(device.into())
    }

    pub fn endpoint(device: impl Into<String>, address: u8) -> Self {
        Self::Endpoint {
            device: device.into(),
            address,
        }
    }
}

/// Exclusive claim, released on drop.
#[derive(Debug)]
pub struct Claim {
    key: ClaimKey,
}

impl Claim {
    /// Returns `None` when somebody else holds `key`.
    pub fn acquire(key: ClaimKey) -> Option<Self> {
        let mut claims = CLAIMS.lock().unwrap_or_else(|e| e.into_inner());
        if !claims.insert(key.clone()) {
            return None;
        }
        debug!("Claimed {:?}", key);
        Some(Self { key })
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        CLAIMS
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
        debug!("Released {:?}", self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let key = ClaimKey::endpoint("claim-test-1", 0x81);
        let first = Claim::acquire(key.clone()).expect("first claim");
        assert!(Claim::acquire(key.clone()).is_none());

        drop(first);
        let second = Claim::acquire(key.clone());
        assert!(second.is_some());
        assert!(Claim::acquire(key).is_none());
    }

    #[test]
    fn test_claims_are_keyed_per_endpoint() {
        let _a = Claim::acquire(ClaimKey::endpoint("claim-test-2", 0x81)).unwrap();
        assert!(Claim::acquire(ClaimKey::endpoint("claim-test-2", 0x82)).is_some());
        assert!(Claim::acquire(ClaimKey::device("claim-test-2")).is_some());
    }
}
