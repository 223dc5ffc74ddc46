//! Error types for the streaming engine

use thiserror::Error;

use crate::capture::frame::Encoding;
use crate::stream::StreamState;
use crate::usb::TransferStatus;

/// Result type alias using StreamError
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors reported by the host stack behind [`crate::usb::UsbTransport`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("endpoint stalled")]
    Stall,

    #[error("operation timed out")]
    Timeout,

    #[error("device disconnected")]
    NoDevice,

    #[error("resource busy")]
    Busy,

    #[error("out of memory")]
    NoMemory,

    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Descriptor block could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed descriptor at offset {offset}: {reason}")]
pub struct DescriptorError {
    pub offset: usize,
    pub reason: String,
}

impl DescriptorError {
    pub fn new(offset: usize, reason: impl Into<String>) -> Self {
        Self {
            offset,
            reason: reason.into(),
        }
    }
}

/// Transfer scheduler start-up failures.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("endpoint 0x{endpoint:02x} already has an active stream")]
    DeviceBusy { endpoint: u8 },

    #[error("transfer buffer allocation failed: {0}")]
    AllocationFailure(String),

    #[error("initial submission failed: {0}")]
    Transport(#[from] TransportError),
}

/// Terminal condition for the current stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamFault {
    #[error("{count} consecutive transfer failures (last status: {last})")]
    TransferFailures { count: u32, last: TransferStatus },

    #[error("device disconnected")]
    Disconnected,

    #[error("{count} consecutive frames failed to decode")]
    DecodeErrors { count: u32 },
}

/// Per-frame decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated MJPEG frame: {0}")]
    Truncated(&'static str),

    #[error("invalid JPEG stream: {0}")]
    Jpeg(String),

    #[error("frame size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("decoded image is {actual_width}x{actual_height}, negotiated {width}x{height}")]
    DimensionMismatch {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("{encoding} needs even dimensions, got {width}x{height}")]
    OddDimensions {
        encoding: Encoding,
        width: u32,
        height: u32,
    },

    #[error("no decoder for {0}")]
    Unsupported(Encoding),
}

/// Stream controller errors surfaced to the host application.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    MalformedDescriptor(#[from] DescriptorError),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("device rejected stream negotiation: {0}")]
    NegotiationRejected(String),

    #[error("device is already streaming: {0}")]
    DeviceBusy(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("{operation} not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: StreamState,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl StreamError {
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedFormat(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::NegotiationRejected(msg.into())
    }

    /// Whether the host may retry `open` with a different request.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedFormat(_) | Self::NegotiationRejected(_) | Self::DeviceBusy(_)
        )
    }
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StreamError::unsupported("YUY2 1920x1080");
        assert_eq!(err.to_string(), "unsupported format: YUY2 1920x1080");

        let err = StreamError::from(DescriptorError::new(9, "bLength exceeds buffer"));
        assert_eq!(
            err.to_string(),
            "malformed descriptor at offset 9: bLength exceeds buffer"
        );
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(StreamError::rejected("stall").is_recoverable());
        assert!(!StreamError::from(DescriptorError::new(0, "x")).is_recoverable());
        assert!(!StreamError::Transport(TransportError::NoDevice).is_recoverable());
    }

    #[test]
    fn test_fault_display() {
        let fault = StreamFault::TransferFailures {
            count: 3,
            last: TransferStatus::Stall,
        };
        assert_eq!(
            fault.to_string(),
            "3 consecutive transfer failures (last status: stall)"
        );
    }
}
