//! Drop-oldest frame queue between reassembly and decode

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tokio::sync::Notify;

use crate::capture::frame::CompletedFrame;

/// Fixed-capacity queue that evicts the oldest frame when full.
///
/// Producer is the dispatch task, consumer the decode worker. The producer
/// never waits for the consumer.
pub struct FrameQueue {
    ring: Mutex<HeapRb<CompletedFrame>>,

    /// Wakes the consumer on push and on close
    ready: Notify,
    closed: AtomicBool,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(HeapRb::new(capacity.max(1))),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn ring(&self) -> MutexGuard<'_, HeapRb<CompletedFrame>> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Producer: push a frame, returning the evicted oldest frame if the
    /// queue was full. Frames pushed after `close` are discarded.
    pub fn push(&self, frame: CompletedFrame) -> Option<CompletedFrame> {
        if self.is_closed() {
            return None;
        }
        let evicted = self.ring().push_overwrite(frame);
        if evicted.is_some() {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<CompletedFrame> {
        let frame = self.ring().try_pop()?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Consumer: wait for the next frame. `None` once the queue is closed.
    pub async fn pop(&self) -> Option<CompletedFrame> {
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            // notify_one leaves a permit if nobody is waiting yet
            self.ready.notified().await;
        }
    }

    /// Stop delivery and wake the consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop every queued frame. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        self.ring().clear()
    }

    pub fn len(&self) -> usize {
        self.ring().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring().capacity().get()
    }

    /// (written, read, dropped)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.frames_written.load(Ordering::Relaxed),
            self.stats.frames_read.load(Ordering::Relaxed),
            self.stats.frames_dropped.load(Ordering::Relaxed),
        )
    }
}
