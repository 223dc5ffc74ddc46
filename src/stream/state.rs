use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

/// Lifecycle of a stream controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum StreamState {
    Closed = 0,
    Negotiating = 1,
    Streaming = 2,
    Stopping = 3,
    /// Terminal for the stream; only `close` is accepted.
    Faulted = 4,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Negotiating,
            2 => Self::Streaming,
            3 => Self::Stopping,
            4 => Self::Faulted,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Negotiating => "negotiating",
            Self::Streaming => "streaming",
            Self::Stopping => "stopping",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// State shared between the controller, the dispatch task and the decode
/// worker.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: StreamState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> StreamState {
        StreamState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: StreamState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Atomically move `from` → `to`. False if the state was not `from`.
    pub(crate) fn transition(&self, from: StreamState, to: StreamState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.get() == StreamState::Streaming
    }
}
