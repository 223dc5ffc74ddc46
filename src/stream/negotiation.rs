//! UVC probe/commit handshake (VS_PROBE_CONTROL / VS_COMMIT_CONTROL).

use std::time::Duration;

use tracing::{debug, instrument};

use crate::error::{StreamError, TransportError};
use crate::usb::{ControlSetup, UsbTransport};

pub const REQUEST_TYPE_SET: u8 = 0x21;
pub const REQUEST_TYPE_GET: u8 = 0xA1;

pub const SET_CUR: u8 = 0x01;
pub const GET_CUR: u8 = 0x81;

pub const VS_PROBE_CONTROL: u8 = 0x01;
pub const VS_COMMIT_CONTROL: u8 = 0x02;

pub const PROBE_LEN_UVC10: usize = 26;
pub const PROBE_LEN_UVC11: usize = 34;
pub const PROBE_LEN_UVC15: usize = 48;

/// bmHint: keep dwFrameInterval fixed.
const HINT_FRAME_INTERVAL: u16 = 0x0001;

/// Control block length for a device's bcdUVC.
pub fn probe_length(uvc_version: u16) -> usize {
    if uvc_version >= 0x0150 {
        PROBE_LEN_UVC15
    } else if uvc_version >= 0x0110 {
        PROBE_LEN_UVC11
    } else {
        PROBE_LEN_UVC10
    }
}

/// Video probe and commit control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeCommit {
    pub hint: u16,
    pub format_index: u8,
    pub frame_index: u8,
    pub frame_interval: u32,
    pub key_frame_rate: u16,
    pub p_frame_rate: u16,
    pub comp_quality: u16,
    pub comp_window_size: u16,
    pub delay: u16,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
    // UVC 1.1
    pub clock_frequency: u32,
    pub framing_info: u8,
    pub preferred_version: u8,
    pub min_version: u8,
    pub max_version: u8,
    // UVC 1.5
    pub usage: u8,
    pub bit_depth_luma: u8,
    pub settings: u8,
    pub max_number_of_ref_frames: u8,
    pub rate_control_modes: u16,
    pub layout_per_stream: u64,
}

impl ProbeCommit {
    pub fn request(format_index: u8, frame_index: u8, frame_interval: u32) -> Self {
        Self {
            hint: HINT_FRAME_INTERVAL,
            format_index,
            frame_index,
            frame_interval,
            ..Default::default()
        }
    }

    /// Serialize, truncated to `len` bytes (26, 34 or 48).
    pub fn encode(&self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(PROBE_LEN_UVC15);
        out.extend_from_slice(&self.hint.to_le_bytes());
        out.push(self.format_index);
        out.push(self.frame_index);
        out.extend_from_slice(&self.frame_interval.to_le_bytes());
        out.extend_from_slice(&self.key_frame_rate.to_le_bytes());
        out.extend_from_slice(&self.p_frame_rate.to_le_bytes());
        out.extend_from_slice(&self.comp_quality.to_le_bytes());
        out.extend_from_slice(&self.comp_window_size.to_le_bytes());
        out.extend_from_slice(&self.delay.to_le_bytes());
        out.extend_from_slice(&self.max_video_frame_size.to_le_bytes());
        out.extend_from_slice(&self.max_payload_transfer_size.to_le_bytes());
        out.extend_from_slice(&self.clock_frequency.to_le_bytes());
        out.extend_from_slice(&[
            self.framing_info,
            self.preferred_version,
            self.min_version,
            self.max_version,
        ]);
        out.extend_from_slice(&[
            self.usage,
            self.bit_depth_luma,
            self.settings,
            self.max_number_of_ref_frames,
        ]);
        out.extend_from_slice(&self.rate_control_modes.to_le_bytes());
        out.extend_from_slice(&self.layout_per_stream.to_le_bytes());
        out.truncate(len);
        out
    }

    /// Parse a device answer. Fields past the end of `bytes` stay zero;
    /// `None` when even the UVC 1.0 block is incomplete.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < PROBE_LEN_UVC10 {
            return None;
        }
        let mut padded = [0u8; PROBE_LEN_UVC15];
        let n = bytes.len().min(PROBE_LEN_UVC15);
        padded[..n].copy_from_slice(&bytes[..n]);
        let b = &padded;

        let u16_at = |at: usize| u16::from_le_bytes([b[at], b[at + 1]]);
        let u32_at = |at: usize| u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]]);
        let mut layout = [0u8; 8];
        layout.copy_from_slice(&b[40..48]);

        Some(Self {
            hint: u16_at(0),
            format_index: b[2],
            frame_index: b[3],
            frame_interval: u32_at(4),
            key_frame_rate: u16_at(8),
            p_frame_rate: u16_at(10),
            comp_quality: u16_at(12),
            comp_window_size: u16_at(14),
            delay: u16_at(16),
            max_video_frame_size: u32_at(18),
            max_payload_transfer_size: u32_at(22),
            clock_frequency: u32_at(26),
            framing_info: b[30],
            preferred_version: b[31],
            min_version: b[32],
            max_version: b[33],
            usage: b[34],
            bit_depth_luma: b[35],
            settings: b[36],
            max_number_of_ref_frames: b[37],
            rate_control_modes: u16_at(38),
            layout_per_stream: u64::from_le_bytes(layout),
        })
    }
}

fn setup(request_type: u8, request: u8, selector: u8, interface: u8) -> ControlSetup {
    ControlSetup {
        request_type,
        request,
        value: (selector as u16) << 8,
        index: interface as u16,
    }
}

/// Stall or timeout on the control pipe means the device refused the
/// parameters; anything else is a transport problem.
fn refused(step: &str, err: TransportError) -> StreamError {
    match err {
        TransportError::Stall | TransportError::Timeout => {
            StreamError::rejected(format!("{}: {}", step, err))
        }
        other => StreamError::Transport(other),
    }
}

/// Run SET_CUR(probe), GET_CUR(probe), SET_CUR(commit).
///
/// Returns the committed block. The device may adjust the interval and
/// payload sizes but must keep the requested format and frame.
#[instrument(skip(transport, request), fields(format = request.format_index, frame = request.frame_index))]
pub fn negotiate(
    transport: &dyn UsbTransport,
    interface: u8,
    uvc_version: u16,
    request: &ProbeCommit,
    timeout: Duration,
) -> Result<ProbeCommit, StreamError> {
    let len = probe_length(uvc_version);

    transport
        .control_out(
            setup(REQUEST_TYPE_SET, SET_CUR, VS_PROBE_CONTROL, interface),
            &request.encode(len),
            timeout,
        )
        .map_err(|e| refused("probe SET_CUR", e))?;

    let answer = transport
        .control_in(
            setup(REQUEST_TYPE_GET, GET_CUR, VS_PROBE_CONTROL, interface),
            len,
            timeout,
        )
        .map_err(|e| refused("probe GET_CUR", e))?;
    let answer = ProbeCommit::decode(&answer).ok_or_else(|| {
        StreamError::rejected(format!("probe answer is {} bytes", answer.len()))
    })?;

    if answer.format_index != request.format_index || answer.frame_index != request.frame_index {
        return Err(StreamError::rejected(format!(
            "device answered format {} frame {}, requested format {} frame {}",
            answer.format_index, answer.frame_index, request.format_index, request.frame_index
        )));
    }
    debug!(
        "Probe answer: interval {}, max frame {} bytes, max payload {} bytes",
        answer.frame_interval, answer.max_video_frame_size, answer.max_payload_transfer_size
    );

    transport
        .control_out(
            setup(REQUEST_TYPE_SET, SET_CUR, VS_COMMIT_CONTROL, interface),
            &answer.encode(len),
            timeout,
        )
        .map_err(|e| refused("commit SET_CUR", e))?;

    Ok(answer)
}
