//! Decode worker: drains the frame queue, decodes on the blocking pool.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::events::{EventHub, StreamEvent};
use super::ringbuf::FrameQueue;
use crate::capture::decoder::FormatDecoder;
use crate::error::{DecodeError, StreamFault};
use crate::stream::state::{StateCell, StreamState};

pub(crate) fn spawn(
    queue: Arc<FrameQueue>,
    decoder: Arc<FormatDecoder>,
    hub: Arc<EventHub>,
    state: Arc<StateCell>,
    max_consecutive_errors: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut consecutive_errors = 0u32;

        while let Some(frame) = queue.pop().await {
            let sequence = frame.meta.sequence;
            let started = Instant::now();
            let decoder = decoder.clone();
            let result = match tokio::task::spawn_blocking(move || decoder.decode(frame)).await {
                Ok(result) => result,
                Err(e) => {
                    error!("Decode of frame {} panicked: {}", sequence, e);
                    Err(DecodeError::Jpeg(e.to_string()))
                }
            };
            metrics::histogram!("uvc_decode_time_us").record(started.elapsed().as_micros() as f64);

            if !state.is_streaming() {
                continue;
            }
            match result {
                Ok(decoded) => {
                    consecutive_errors = 0;
                    hub.deliver(decoded);
                }
                Err(error) => {
                    consecutive_errors += 1;
                    hub.emit(StreamEvent::DecodeError { sequence, error });
                    if consecutive_errors >= max_consecutive_errors
                        && state.transition(StreamState::Streaming, StreamState::Faulted)
                    {
                        queue.close();
                        hub.emit(StreamEvent::Fault(StreamFault::DecodeErrors {
                            count: consecutive_errors,
                        }));
                    }
                }
            }
        }
        debug!("Decode worker finished");
    })
}
