//! Dispatch-side end of the pipeline: payloads in, frames onto the queue.

use std::sync::Arc;

use tracing::debug;

use super::events::{EventHub, StreamEvent};
use super::ringbuf::FrameQueue;
use crate::capture::reassembler::{Assembly, DropReason, FrameReassembler};
use crate::capture::scheduler::PayloadSink;
use crate::error::StreamFault;
use crate::stream::state::{StateCell, StreamState};

pub(crate) struct PipelineSink {
    reassembler: FrameReassembler,
    queue: Arc<FrameQueue>,
    hub: Arc<EventHub>,
    state: Arc<StateCell>,
}

impl PipelineSink {
    pub(crate) fn new(
        reassembler: FrameReassembler,
        queue: Arc<FrameQueue>,
        hub: Arc<EventHub>,
        state: Arc<StateCell>,
    ) -> Self {
        Self {
            reassembler,
            queue,
            hub,
            state,
        }
    }
}

fn route(assembly: Assembly, queue: &FrameQueue, hub: &EventHub) {
    match assembly {
        Assembly::Frame(frame) => {
            hub.stats().frame_completed();
            metrics::counter!("uvc_frames_completed").increment(1);
            if let Some(evicted) = queue.push(frame) {
                hub.emit(StreamEvent::FrameDropped {
                    reason: DropReason::Backpressure,
                    sequence: Some(evicted.meta.sequence),
                    bytes: evicted.data.len(),
                });
            }
        }
        Assembly::Dropped { reason, bytes } => hub.emit(StreamEvent::FrameDropped {
            reason,
            sequence: None,
            bytes,
        }),
        Assembly::Partial { bytes } => hub.emit(StreamEvent::PartialFrame { bytes }),
        Assembly::HeaderTooShort(e) => hub.emit(StreamEvent::HeaderTooShort {
            available: e.available,
            required: e.required,
        }),
    }
}

impl PayloadSink for PipelineSink {
    fn payload(&mut self, payload: &[u8]) {
        if !self.state.is_streaming() {
            return;
        }
        self.hub.stats().payload();
        let (queue, hub) = (&self.queue, &self.hub);
        self.reassembler
            .push(payload, |assembly| route(assembly, queue, hub));
    }

    fn fault(&mut self, fault: StreamFault) {
        if !self
            .state
            .transition(StreamState::Streaming, StreamState::Faulted)
        {
            debug!("Ignoring {} outside of streaming", fault);
            return;
        }
        self.queue.close();
        let event = match fault {
            StreamFault::Disconnected => StreamEvent::Disconnected,
            other => StreamEvent::Fault(other),
        };
        self.hub.emit(event);
    }

    /// A decode fault or host-reported disconnect ends the transfers too.
    fn is_closed(&self) -> bool {
        self.state.get() == StreamState::Faulted
    }
}

impl Drop for PipelineSink {
    fn drop(&mut self) {
        let discarded = self.reassembler.reset();
        if discarded > 0 {
            debug!(
                "Discarded {} bytes of the frame after {}",
                discarded,
                self.reassembler.last_sequence()
            );
        }
    }
}
