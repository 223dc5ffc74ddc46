//! Per-stream counters readable from any thread.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use serde::Serialize;

#[derive(Debug, Default)]
pub struct StreamStats {
    payloads: CachePadded<AtomicU64>,
    frames_completed: CachePadded<AtomicU64>,
    frames_delivered: CachePadded<AtomicU64>,
    dropped_payload_error: AtomicU64,
    dropped_backpressure: AtomicU64,
    dropped_overflow: AtomicU64,
    partial_frames: AtomicU64,
    header_too_short: AtomicU64,
    decode_errors: AtomicU64,
}

/// Point-in-time copy of [`StreamStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub payloads: u64,
    pub frames_completed: u64,
    pub frames_delivered: u64,
    pub dropped_payload_error: u64,
    pub dropped_backpressure: u64,
    pub dropped_overflow: u64,
    pub partial_frames: u64,
    pub header_too_short: u64,
    pub decode_errors: u64,
}

impl StatsSnapshot {
    pub fn frames_dropped(&self) -> u64 {
        self.dropped_payload_error + self.dropped_backpressure + self.dropped_overflow
    }
}

macro_rules! bump {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl StreamStats {
    bump! {
        payload => payloads,
        frame_completed => frames_completed,
        frame_delivered => frames_delivered,
        payload_error => dropped_payload_error,
        backpressure => dropped_backpressure,
        overflow => dropped_overflow,
        partial_frame => partial_frames,
        header_too_short => header_too_short,
        decode_error => decode_errors,
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            payloads: self.payloads.load(Ordering::Relaxed),
            frames_completed: self.frames_completed.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            dropped_payload_error: self.dropped_payload_error.load(Ordering::Relaxed),
            dropped_backpressure: self.dropped_backpressure.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            partial_frames: self.partial_frames.load(Ordering::Relaxed),
            header_too_short: self.header_too_short.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        for counter in [
            &*self.payloads,
            &*self.frames_completed,
            &*self.frames_delivered,
            &self.dropped_payload_error,
            &self.dropped_backpressure,
            &self.dropped_overflow,
            &self.partial_frames,
            &self.header_too_short,
            &self.decode_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
