//! In-memory UVC device.
//!
//! Serves descriptors produced by [`ConfigurationBuilder`], answers the
//! probe/commit handshake and completes submitted transfers from a queue of
//! scripted payloads. Completions are only posted when the owner calls
//! [`LoopbackTransport::complete_next`] or [`LoopbackTransport::pump`], so
//! tests control timing exactly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use super::{
    Completion, ControlSetup, SubmitError, Transfer, TransferId, TransferKind, TransferStatus,
    UsbTransport,
};
use crate::capture::payload::PayloadHeader;
use crate::descriptor::ConfigurationBuilder;
use crate::error::TransportError;
use crate::stream::negotiation::{
    ProbeCommit, GET_CUR, REQUEST_TYPE_GET, REQUEST_TYPE_SET, SET_CUR, VS_COMMIT_CONTROL,
    VS_PROBE_CONTROL,
};

static NEXT_DEVICE: AtomicU64 = AtomicU64::new(1);

const DEFAULT_MAX_PAYLOAD: u32 = 3072;

struct Pending {
    transfer: Transfer,
    completions: flume::Sender<Completion>,
}

#[derive(Default)]
struct State {
    connected: bool,
    reject_probe: bool,
    answer_frame: Option<u8>,
    probe: Option<ProbeCommit>,
    committed: Option<ProbeCommit>,
    interface_calls: Vec<(u8, u8)>,
    pending: VecDeque<Pending>,
    payloads: VecDeque<Vec<u8>>,
    toggle: bool,
    failing_submits: usize,
    submitted: usize,
    cancelled: usize,
}

pub struct LoopbackTransport {
    device_id: String,
    vendor_id: u16,
    product_id: u16,
    device: ConfigurationBuilder,
    max_payload: u32,
    state: Mutex<State>,
}

impl LoopbackTransport {
    pub fn new(device: ConfigurationBuilder) -> Self {
        let n = NEXT_DEVICE.fetch_add(1, Ordering::Relaxed);
        Self {
            device_id: format!("loopback-{}", n),
            vendor_id: 0x1d6b,
            product_id: 0x0102,
            device,
            max_payload: DEFAULT_MAX_PAYLOAD,
            state: Mutex::new(State {
                connected: true,
                ..Default::default()
            }),
        }
    }

    /// YUY2 + MJPEG webcam with five isochronous alternate settings.
    pub fn webcam() -> Self {
        Self::new(ConfigurationBuilder::webcam())
    }

    /// dwMaxPayloadTransferSize reported in probe answers.
    pub fn with_max_payload(mut self, bytes: u32) -> Self {
        self.max_payload = bytes;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stall every probe SET_CUR from now on.
    pub fn reject_probe(&self, reject: bool) {
        self.lock().reject_probe = reject;
    }

    /// Answer probes with this frame index instead of the requested one.
    pub fn answer_frame(&self, frame_index: Option<u8>) {
        self.lock().answer_frame = frame_index;
    }

    /// Refuse the next `n` submissions.
    pub fn fail_submits(&self, n: usize) {
        self.lock().failing_submits = n;
    }

    pub fn committed(&self) -> Option<ProbeCommit> {
        self.lock().committed
    }

    pub fn interface_calls(&self) -> Vec<(u8, u8)> {
        self.lock().interface_calls.clone()
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn submitted(&self) -> usize {
        self.lock().submitted
    }

    pub fn cancelled(&self) -> usize {
        self.lock().cancelled
    }

    pub fn queued_payloads(&self) -> usize {
        self.lock().payloads.len()
    }

    /// Queue one raw payload (header included).
    pub fn queue_payload(&self, payload: Vec<u8>) {
        self.lock().payloads.push_back(payload);
    }

    /// Split `data` into payloads of at most `payload_size` bytes with a
    /// 2-byte header, set EOF on the last one and flip FID for the next
    /// frame.
    pub fn queue_frame(&self, data: &[u8], payload_size: usize) {
        let mut state = self.lock();
        let chunk = payload_size.saturating_sub(2).max(1);
        let count = data.len().div_ceil(chunk).max(1);
        for i in 0..count {
            let start = (i * chunk).min(data.len());
            let end = ((i + 1) * chunk).min(data.len());
            let header = PayloadHeader {
                frame_id: state.toggle,
                end_of_frame: i + 1 == count,
                ..Default::default()
            };
            let mut payload = header.encode();
            payload.extend_from_slice(&data[start..end]);
            state.payloads.push_back(payload);
        }
        state.toggle = !state.toggle;
    }

    /// Complete the oldest pending transfer with `status`. Successful
    /// completions are filled from the payload queue. Returns false when
    /// nothing is pending.
    pub fn complete_next(&self, status: TransferStatus) -> bool {
        self.complete_nth(0, status)
    }

    /// Complete the `n`th pending transfer (oldest is 0), so completions
    /// can arrive out of submission order.
    pub fn complete_nth(&self, n: usize, status: TransferStatus) -> bool {
        let completion = {
            let mut state = self.lock();
            let Some(Pending {
                mut transfer,
                completions,
            }) = state.pending.remove(n)
            else {
                return false;
            };
            if status.is_success() {
                fill(&mut transfer, &mut state.payloads);
            }
            (completions, Completion { transfer, status })
        };
        post(completion);
        true
    }

    /// Complete pending transfers until the payload queue is drained.
    /// Returns the number of completions posted.
    pub fn pump(&self) -> usize {
        let mut n = 0;
        while self.queued_payloads() > 0 && self.complete_next(TransferStatus::Completed) {
            n += 1;
        }
        n
    }

    /// Simulate unplugging: every pending transfer completes with
    /// `NoDevice` and further requests fail.
    pub fn disconnect(&self) {
        let drained: Vec<Pending> = {
            let mut state = self.lock();
            state.connected = false;
            state.pending.drain(..).collect()
        };
        debug!("{} disconnected with {} transfers pending", self.device_id, drained.len());
        for p in drained {
            post((
                p.completions,
                Completion {
                    transfer: p.transfer,
                    status: TransferStatus::NoDevice,
                },
            ));
        }
    }

    fn probe_answer(&self, state: &State) -> Result<Bytes, TransportError> {
        let Some(mut answer) = state.probe else {
            return Err(TransportError::Stall);
        };
        let Some((format, frame)) = self.device.lookup(answer.format_index, answer.frame_index)
        else {
            return Err(TransportError::Stall);
        };
        if !frame.intervals.supports(answer.frame_interval) {
            answer.frame_interval = frame.default_interval();
        }
        answer.max_video_frame_size = format.max_frame_size(frame);
        answer.max_payload_transfer_size = self.max_payload;
        if let Some(index) = state.answer_frame {
            answer.frame_index = index;
        }
        Ok(Bytes::from(answer.encode(crate::stream::negotiation::probe_length(
            self.device.version(),
        ))))
    }
}

fn fill(transfer: &mut Transfer, payloads: &mut VecDeque<Vec<u8>>) {
    match transfer.kind() {
        TransferKind::Isochronous => {
            for i in 0..transfer.packet_count() {
                let Some(payload) = payloads.pop_front() else {
                    break;
                };
                transfer.fill_packet(i, &payload, TransferStatus::Completed);
            }
        }
        TransferKind::Bulk => {
            if let Some(payload) = payloads.pop_front() {
                transfer.fill_bulk(&payload);
            }
        }
    }
}

fn post((completions, completion): (flume::Sender<Completion>, Completion)) {
    if completions.send(completion).is_err() {
        trace!("Completion receiver gone");
    }
}

impl UsbTransport for LoopbackTransport {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn device_descriptor(&self) -> Result<Bytes, TransportError> {
        if !self.lock().connected {
            return Err(TransportError::NoDevice);
        }
        Ok(Bytes::from(ConfigurationBuilder::device_descriptor(
            self.vendor_id,
            self.product_id,
        )))
    }

    fn configuration_descriptor(&self) -> Result<Bytes, TransportError> {
        if !self.lock().connected {
            return Err(TransportError::NoDevice);
        }
        Ok(Bytes::from(self.device.build()))
    }

    fn control_in(
        &self,
        setup: ControlSetup,
        length: usize,
        _timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        let state = self.lock();
        if !state.connected {
            return Err(TransportError::NoDevice);
        }
        let selector = (setup.value >> 8) as u8;
        match (setup.request_type, setup.request, selector) {
            (REQUEST_TYPE_GET, GET_CUR, VS_PROBE_CONTROL) => {
                let mut answer = self.probe_answer(&state)?;
                answer.truncate(length);
                Ok(answer)
            }
            _ => Err(TransportError::Stall),
        }
    }

    fn control_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NoDevice);
        }
        let selector = (setup.value >> 8) as u8;
        match (setup.request_type, setup.request, selector) {
            (REQUEST_TYPE_SET, SET_CUR, VS_PROBE_CONTROL) => {
                if state.reject_probe {
                    return Err(TransportError::Stall);
                }
                state.probe = Some(ProbeCommit::decode(data).ok_or(TransportError::Stall)?);
                Ok(data.len())
            }
            (REQUEST_TYPE_SET, SET_CUR, VS_COMMIT_CONTROL) => {
                state.committed = Some(ProbeCommit::decode(data).ok_or(TransportError::Stall)?);
                Ok(data.len())
            }
            _ => Err(TransportError::Stall),
        }
    }

    fn set_interface(&self, interface: u8, alt_setting: u8) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NoDevice);
        }
        state.interface_calls.push((interface, alt_setting));
        Ok(())
    }

    fn submit(
        &self,
        transfer: Transfer,
        completions: flume::Sender<Completion>,
    ) -> Result<(), SubmitError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(SubmitError {
                transfer,
                error: TransportError::NoDevice,
            });
        }
        if state.failing_submits > 0 {
            state.failing_submits -= 1;
            return Err(SubmitError {
                transfer,
                error: TransportError::Io("injected submit failure".into()),
            });
        }
        state.submitted += 1;
        state.pending.push_back(Pending {
            transfer,
            completions,
        });
        Ok(())
    }

    fn cancel(&self, endpoint: u8, id: TransferId) -> Result<(), TransportError> {
        let cancelled = {
            let mut state = self.lock();
            let position = state
                .pending
                .iter()
                .position(|p| p.transfer.endpoint() == endpoint && p.transfer.id() == id);
            position.and_then(|i| {
                state.cancelled += 1;
                state.pending.remove(i)
            })
        };
        // Already completed transfers are not an error.
        if let Some(p) = cancelled {
            post((
                p.completions,
                Completion {
                    transfer: p.transfer,
                    status: TransferStatus::Cancelled,
                },
            ));
        }
        Ok(())
    }
}
