//! Host-facing notifications and callback registration.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::{debug, error, warn};

use super::stats::StreamStats;
use crate::capture::frame::DecodedFrame;
use crate::capture::reassembler::DropReason;
use crate::error::{DecodeError, StreamFault};

/// Non-frame notifications delivered to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    FrameDropped {
        reason: DropReason,
        /// Known when a completed frame was evicted
        sequence: Option<u64>,
        bytes: usize,
    },
    PartialFrame {
        bytes: usize,
    },
    HeaderTooShort {
        available: usize,
        required: usize,
    },
    DecodeError {
        sequence: u64,
        error: DecodeError,
    },
    /// The stream is faulted and will deliver nothing more.
    Fault(StreamFault),
    Disconnected,
}

pub type FrameCallback = Box<dyn Fn(DecodedFrame) + Send + Sync>;
pub type EventCallback = Box<dyn Fn(&StreamEvent) + Send + Sync>;

/// Fan-out point for frames and events. Callbacks can be swapped at any
/// time without blocking the dispatch or decode contexts.
pub struct EventHub {
    frames: ArcSwapOption<FrameCallback>,
    events: ArcSwapOption<EventCallback>,
    stats: Arc<StreamStats>,
}

impl EventHub {
    pub fn new(stats: Arc<StreamStats>) -> Self {
        Self {
            frames: ArcSwapOption::empty(),
            events: ArcSwapOption::empty(),
            stats,
        }
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn set_frame_callback(&self, callback: FrameCallback) {
        self.frames.store(Some(Arc::new(callback)));
    }

    pub fn set_event_callback(&self, callback: EventCallback) {
        self.events.store(Some(Arc::new(callback)));
    }

    pub fn deliver(&self, frame: DecodedFrame) {
        self.stats.frame_delivered();
        metrics::counter!("uvc_frames_delivered").increment(1);
        if let Some(callback) = &*self.frames.load() {
            callback(frame);
        }
    }

    pub fn emit(&self, event: StreamEvent) {
        match &event {
            StreamEvent::FrameDropped {
                reason,
                sequence,
                bytes,
            } => {
                match reason {
                    DropReason::PayloadError => self.stats.payload_error(),
                    DropReason::Backpressure => self.stats.backpressure(),
                    DropReason::Overflow => self.stats.overflow(),
                }
                metrics::counter!("uvc_frames_dropped").increment(1);
                debug!("Frame {:?} dropped ({}): {} bytes", sequence, reason, bytes);
            }
            StreamEvent::PartialFrame { bytes } => {
                self.stats.partial_frame();
                metrics::counter!("uvc_partial_frames").increment(1);
                warn!("Partial frame of {} bytes dropped", bytes);
            }
            StreamEvent::HeaderTooShort {
                available,
                required,
            } => {
                self.stats.header_too_short();
                metrics::counter!("uvc_header_too_short").increment(1);
                debug!(
                    "Payload header too short: {} bytes, {} required",
                    available, required
                );
            }
            StreamEvent::DecodeError { sequence, error } => {
                self.stats.decode_error();
                metrics::counter!("uvc_decode_errors").increment(1);
                warn!("Frame {} failed to decode: {}", sequence, error);
            }
            StreamEvent::Fault(fault) => error!("Stream fault: {}", fault),
            StreamEvent::Disconnected => warn!("Device disconnected"),
        }

        if let Some(callback) = &*self.events.load() {
            callback(&event);
        }
    }
}
