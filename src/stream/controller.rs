//! Stream lifecycle: descriptor discovery, negotiation, start and stop.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::config::{finalize, resolve, StreamConfig, StreamRequest};
use super::negotiation::negotiate;
use super::state::{StateCell, StreamState};
use crate::capture::decoder::{Codecs, FormatDecoder};
use crate::capture::frame::DecodedFrame;
use crate::capture::reassembler::FrameReassembler;
use crate::capture::scheduler::TransferScheduler;
use crate::descriptor::{self, DeviceDescriptor};
use crate::error::{Result, StreamError};
use crate::pipeline::events::{EventHub, StreamEvent};
use crate::pipeline::ringbuf::FrameQueue;
use crate::pipeline::sink::PipelineSink;
use crate::pipeline::stats::{StatsSnapshot, StreamStats};
use crate::pipeline::worker;
use crate::usb::claim::{Claim, ClaimKey};
use crate::usb::UsbTransport;
use crate::EngineConfig;

/// Everything owned by an open stream.
struct ActiveStream {
    config: StreamConfig,
    scheduler: TransferScheduler,
    queue: Arc<FrameQueue>,
    worker: JoinHandle<()>,
    _claim: Claim,
}

/// Drives one UVC device from `Closed` to `Streaming` and back.
///
/// Frames and events are delivered through callbacks registered with
/// [`on_frame`](Self::on_frame) and [`on_event`](Self::on_event); they run
/// on the decode worker and the dispatch task respectively, so keep them
/// short.
pub struct StreamController {
    transport: Arc<dyn UsbTransport>,
    codecs: Codecs,
    config: EngineConfig,
    state: Arc<StateCell>,
    stats: Arc<StreamStats>,
    hub: Arc<EventHub>,
    descriptor: Option<DeviceDescriptor>,
    active: Option<ActiveStream>,
}

impl StreamController {
    pub fn new(transport: Arc<dyn UsbTransport>, codecs: Codecs, config: EngineConfig) -> Self {
        let stats = Arc::new(StreamStats::default());
        Self {
            transport,
            codecs,
            config,
            state: Arc::new(StateCell::new(StreamState::Closed)),
            hub: Arc::new(EventHub::new(stats.clone())),
            stats,
            descriptor: None,
            active: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Negotiated parameters of the open stream.
    pub fn config(&self) -> Option<&StreamConfig> {
        self.active.as_ref().map(|a| &a.config)
    }

    /// Parsed catalog of the open device.
    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn on_frame<F>(&self, callback: F)
    where
        F: Fn(DecodedFrame) + Send + Sync + 'static,
    {
        self.hub.set_frame_callback(Box::new(callback));
    }

    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.hub.set_event_callback(Box::new(callback));
    }

    /// Route decoded frames into a bounded channel instead of a callback.
    /// Frames are dropped when the receiver falls behind.
    pub fn subscribe_frames(&self, capacity: usize) -> flume::Receiver<DecodedFrame> {
        let (tx, rx) = flume::bounded(capacity.max(1));
        self.on_frame(move |frame| {
            if let Err(flume::TrySendError::Full(frame)) = tx.try_send(frame) {
                debug!("Subscriber full, dropping frame {}", frame.sequence);
            }
        });
        rx
    }

    /// Negotiate `request` with the device and start streaming.
    ///
    /// An empty request falls back to the configured stream parameters,
    /// then to the configured preset.
    #[instrument(skip_all, fields(device = %self.transport.device_id()))]
    pub async fn open(&mut self, request: &StreamRequest) -> Result<&StreamConfig> {
        let state = self.state.get();
        if state != StreamState::Closed {
            return Err(StreamError::InvalidState {
                operation: "open",
                state,
            });
        }

        let device_id = self.transport.device_id();
        let claim = Claim::acquire(ClaimKey::device(device_id.clone()))
            .ok_or_else(|| StreamError::DeviceBusy(device_id))?;

        self.state.set(StreamState::Negotiating);
        self.stats.reset();

        let request = if request.is_empty() {
            self.config.stream.clone()
        } else {
            request.clone()
        };

        match self.start(&request, claim).await {
            Ok(active) => {
                let config = &self.active.insert(active).config;
                info!(
                    "Streaming {} {}x{} @ {:.2} fps (alt {}, {} x {} x {} bytes)",
                    config.encoding,
                    config.width,
                    config.height,
                    config.fps(),
                    config.alt_setting,
                    config.active_urbs,
                    config.packets_per_request,
                    config.max_packet_size
                );
                Ok(config)
            }
            Err(e) => {
                warn!("Open failed: {}", e);
                self.descriptor = None;
                self.state.set(StreamState::Closed);
                Err(e)
            }
        }
    }

    async fn start(&mut self, request: &StreamRequest, claim: Claim) -> Result<ActiveStream> {
        let device = self.transport.device_descriptor()?;
        let configuration = self.transport.configuration_descriptor()?;
        let catalog = descriptor::parse(&device, &configuration)?;
        debug!(
            "Device {:04x}:{:04x}, UVC {}, {} streaming interface(s)",
            catalog.vendor_id,
            catalog.product_id,
            crate::utils::bcd_to_string(catalog.uvc_version),
            catalog.streaming.len()
        );

        let resolved = resolve(
            request,
            self.config.preset,
            &catalog,
            &self.config.transfer,
        )?;
        let answer = negotiate(
            self.transport.as_ref(),
            resolved.interface,
            resolved.uvc_version,
            &resolved.probe(),
            self.config.transfer.control_timeout(),
        )?;
        let config = finalize(resolved, &catalog, &answer)?;
        self.descriptor = Some(catalog);

        self.transport
            .set_interface(config.interface, config.alt_setting)?;

        let layout = config.layout();
        let queue = Arc::new(FrameQueue::new(self.config.pipeline.queue_capacity));
        let decoder = Arc::new(FormatDecoder::new(
            layout,
            self.config.pipeline.output_format,
            self.codecs.clone(),
        ));
        let worker = worker::spawn(
            queue.clone(),
            decoder,
            self.hub.clone(),
            self.state.clone(),
            self.config.pipeline.max_consecutive_decode_errors,
        );
        let sink = PipelineSink::new(
            FrameReassembler::new(layout),
            queue.clone(),
            self.hub.clone(),
            self.state.clone(),
        );

        // Completions may arrive as soon as the first request is queued
        self.state.set(StreamState::Streaming);
        let scheduler = match TransferScheduler::start(
            self.transport.clone(),
            config.scheduler(&self.config.transfer),
            sink,
        )
        .await
        {
            Ok(scheduler) => scheduler,
            Err(e) => {
                queue.close();
                if let Err(e) = worker.await {
                    error!("Decode worker failed: {}", e);
                }
                self.reset_interface(config.interface);
                return Err(e.into());
            }
        };

        Ok(ActiveStream {
            config,
            scheduler,
            queue,
            worker,
            _claim: claim,
        })
    }

    /// Stop streaming and release the device. Closing a closed controller
    /// is a no-op.
    #[instrument(skip_all, fields(device = %self.transport.device_id()))]
    pub async fn close(&mut self) -> Result<()> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };
        self.state.set(StreamState::Stopping);

        active.scheduler.stop().await;
        active.queue.close();
        let discarded = active.queue.clear();
        if discarded > 0 {
            debug!("Discarded {} queued frame(s)", discarded);
        }
        if let Err(e) = active.worker.await {
            error!("Decode worker failed: {}", e);
        }
        self.reset_interface(active.config.interface);

        self.descriptor = None;
        drop(active._claim);
        self.state.set(StreamState::Closed);

        let stats = self.stats.snapshot();
        info!(
            "Stream closed: {} frames delivered, {} dropped",
            stats.frames_delivered,
            stats.frames_dropped()
        );
        Ok(())
    }

    /// Host-side hot-unplug notice. Stops delivery; `close` is still
    /// required to release resources.
    pub fn notify_disconnect(&self) {
        if self
            .state
            .transition(StreamState::Streaming, StreamState::Faulted)
        {
            if let Some(active) = &self.active {
                active.queue.close();
            }
            self.hub.emit(StreamEvent::Disconnected);
        }
    }

    fn reset_interface(&self, interface: u8) {
        if let Err(e) = self.transport.set_interface(interface, 0) {
            warn!("Could not reset interface {} to alt 0: {}", interface, e);
        }
    }
}

impl Drop for StreamController {
    /// Without `close` nothing can be awaited here: the scheduler's task is
    /// told to cancel and drain on its own, and the worker ends with the
    /// closed queue.
    fn drop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        warn!("Stream controller dropped without close");
        self.state.set(StreamState::Stopping);
        active.queue.close();
        drop(active.scheduler);
        self.reset_interface(active.config.interface);
        self.state.set(StreamState::Closed);
    }
}
