//! Stream requests, presets and their resolution against a device catalog.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::negotiation::ProbeCommit;
use crate::capture::frame::{Encoding, FrameLayout};
use crate::capture::scheduler::SchedulerConfig;
use crate::descriptor::{DeviceDescriptor, FormatDescriptor, FrameDescriptor, FrameIntervals};
use crate::error::StreamError;
use crate::usb::TransferKind;
use crate::utils::{fps_to_interval, interval_to_fps};
use crate::TransferConfig;

/// Host-supplied stream parameters. Every field is optional; unset fields
/// are filled from the device and from [`TransferConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamRequest {
    pub interface: Option<u8>,
    pub format_index: Option<u8>,
    pub frame_index: Option<u8>,
    /// Select the format by encoding instead of index
    pub encoding: Option<Encoding>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// 100 ns units
    pub frame_interval: Option<u32>,
    pub alt_setting: Option<u8>,
    pub max_packet_size: Option<usize>,
    pub packets_per_request: Option<usize>,
    /// Transfer requests kept in flight
    pub active_urbs: Option<usize>,
    pub unit_id: Option<u8>,
    pub terminal_id: Option<u8>,
    /// bmControls of the camera terminal
    pub control_terminal: Option<Vec<u8>>,
    /// bmControls of the processing unit
    pub control_unit: Option<Vec<u8>>,
    pub still_capture_method: Option<u8>,
    pub bulk: Option<bool>,
}

impl StreamRequest {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Known-good parameter sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// MJPEG 800x600 @ 30 fps, 32 requests of 32 x 1024-byte packets
    #[default]
    Default,
    /// Logitech Brio: MJPEG 640x480 @ 30 fps, 64 requests of 96 x 1024 bytes
    BrioStable,
}

impl Preset {
    pub fn request(&self) -> StreamRequest {
        let (width, height, urbs, packets) = match self {
            Self::Default => (800, 600, 32, 32),
            Self::BrioStable => (640, 480, 64, 96),
        };
        StreamRequest {
            encoding: Some(Encoding::Mjpeg),
            width: Some(width),
            height: Some(height),
            frame_interval: Some(fps_to_interval(30.0)),
            alt_setting: Some(4),
            max_packet_size: Some(1024),
            packets_per_request: Some(packets),
            active_urbs: Some(urbs),
            ..Default::default()
        }
    }
}

/// Format selection fixed, transport parameters pending the probe answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRequest {
    pub interface: u8,
    pub endpoint: u8,
    pub uvc_version: u16,
    pub format: FormatDescriptor,
    pub frame: FrameDescriptor,
    pub frame_interval: u32,
    pub bulk: bool,
    pub alt_setting: Option<u8>,
    /// A preset's alt-setting is only a preference
    pub alt_is_hint: bool,
    pub max_packet_size: Option<usize>,
    pub packets_per_request: usize,
    pub active_urbs: usize,
    pub unit_id: Option<u8>,
    pub terminal_id: Option<u8>,
    pub control_terminal: Vec<u8>,
    pub control_unit: Vec<u8>,
    pub still_capture_method: u8,
}

impl ResolvedRequest {
    pub fn probe(&self) -> ProbeCommit {
        ProbeCommit::request(self.format.index, self.frame.index, self.frame_interval)
    }
}

/// The immutable negotiated tuple of an open stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamConfig {
    pub interface: u8,
    pub format_index: u8,
    pub frame_index: u8,
    pub encoding: Encoding,
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    pub frame_interval: u32,
    pub alt_setting: u8,
    pub endpoint: u8,
    pub transfer: TransferKind,
    pub max_packet_size: usize,
    pub packets_per_request: usize,
    pub active_urbs: usize,
    pub max_video_frame_size: u32,
    pub max_payload_transfer_size: u32,
    pub uvc_version: u16,
    pub unit_id: Option<u8>,
    pub terminal_id: Option<u8>,
    pub control_terminal: Vec<u8>,
    pub control_unit: Vec<u8>,
    pub still_capture_method: u8,
}

impl StreamConfig {
    pub fn fps(&self) -> f64 {
        interval_to_fps(self.frame_interval)
    }

    pub fn is_bulk(&self) -> bool {
        self.transfer == TransferKind::Bulk
    }

    pub fn layout(&self) -> FrameLayout {
        FrameLayout {
            encoding: self.encoding,
            width: self.width,
            height: self.height,
            bits_per_pixel: self.bits_per_pixel,
            max_frame_size: (self.max_video_frame_size > 0)
                .then_some(self.max_video_frame_size as usize),
        }
    }

    pub fn scheduler(&self, transfer: &TransferConfig) -> SchedulerConfig {
        SchedulerConfig {
            endpoint: self.endpoint,
            mode: self.transfer,
            packet_size: self.max_packet_size,
            packets_per_request: self.packets_per_request,
            request_count: self.active_urbs,
            cancel_timeout: transfer.cancel_timeout(),
        }
    }
}

/// Pick interface, format, frame and interval for `request`.
///
/// An empty request means `preset` (or [`Preset::Default`]). Explicit
/// fields are never overridden; each defaulted field is logged.
pub fn resolve(
    request: &StreamRequest,
    preset: Option<Preset>,
    catalog: &DeviceDescriptor,
    transfer: &TransferConfig,
) -> Result<ResolvedRequest, StreamError> {
    let from_preset = request.is_empty();
    let request = if from_preset {
        let preset = preset.unwrap_or_default();
        info!("No stream parameters set, using preset {:?}", preset);
        preset.request()
    } else {
        request.clone()
    };

    let iface = match request.interface {
        Some(n) => catalog
            .streaming_interface(n)
            .ok_or_else(|| StreamError::unsupported(format!("no streaming interface {}", n)))?,
        None => catalog
            .streaming
            .first()
            .ok_or_else(|| StreamError::unsupported("device has no streaming interface"))?,
    };

    let format = select_format(&request, &iface.formats)?;
    let frame = select_frame(&request, format)?;

    let frame_interval = match request.frame_interval {
        Some(interval) if frame.intervals.supports(interval) => interval,
        Some(interval) => {
            return Err(StreamError::unsupported(format!(
                "{} {}x{} does not support interval {} (supported: {})",
                format.encoding, frame.width, frame.height, interval, frame.intervals
            )))
        }
        None => {
            let interval = default_interval(frame);
            info!(
                "frame_interval unset, using device default {} ({:.1} fps)",
                interval,
                interval_to_fps(interval)
            );
            interval
        }
    };

    let has_iso = !iface.isochronous_alts().is_empty();
    let bulk = match request.bulk {
        Some(true) if iface.bulk_endpoint().is_none() => {
            return Err(StreamError::unsupported("device has no bulk streaming endpoint"))
        }
        Some(false) if !has_iso => {
            return Err(StreamError::unsupported(
                "device has no isochronous alternate setting",
            ))
        }
        Some(bulk) => bulk,
        None => {
            let bulk = !has_iso && iface.bulk_endpoint().is_some();
            if bulk {
                info!("Device streams over bulk endpoint");
            }
            bulk
        }
    };

    if let (Some(alt), false, false) = (request.alt_setting, bulk, from_preset) {
        let valid = iface
            .isochronous_alts()
            .iter()
            .any(|a| a.alt_setting == alt);
        if !valid {
            return Err(StreamError::unsupported(format!(
                "alternate setting {} has no isochronous endpoint",
                alt
            )));
        }
    }

    let packets_per_request = request.packets_per_request.unwrap_or_else(|| {
        info!(
            "packets_per_request unset, using {}",
            transfer.packets_per_request
        );
        transfer.packets_per_request
    });
    let active_urbs = request.active_urbs.unwrap_or_else(|| {
        info!("active_urbs unset, using {}", transfer.active_urbs);
        transfer.active_urbs
    });

    let camera = catalog.control.camera_terminal();
    let processing = catalog.control.processing_units.first();

    Ok(ResolvedRequest {
        interface: iface.interface,
        endpoint: iface.endpoint_address,
        uvc_version: catalog.uvc_version,
        format: format.clone(),
        frame: frame.clone(),
        frame_interval,
        bulk,
        alt_setting: request.alt_setting,
        alt_is_hint: from_preset,
        max_packet_size: request.max_packet_size.or(transfer.max_packet_size),
        packets_per_request,
        active_urbs,
        unit_id: request.unit_id.or(processing.map(|p| p.id)),
        terminal_id: request.terminal_id.or(camera.map(|t| t.id)),
        control_terminal: request
            .control_terminal
            .unwrap_or_else(|| camera.map(|t| t.controls.clone()).unwrap_or_default()),
        control_unit: request
            .control_unit
            .unwrap_or_else(|| processing.map(|p| p.controls.clone()).unwrap_or_default()),
        still_capture_method: request
            .still_capture_method
            .unwrap_or(iface.still_capture_method),
    })
}

fn select_format<'a>(
    request: &StreamRequest,
    formats: &'a [FormatDescriptor],
) -> Result<&'a FormatDescriptor, StreamError> {
    match (request.format_index, request.encoding) {
        (Some(index), encoding) => {
            let format = formats
                .iter()
                .find(|f| f.index == index)
                .ok_or_else(|| StreamError::unsupported(format!("no format with index {}", index)))?;
            if let Some(encoding) = encoding.filter(|e| *e != format.encoding) {
                return Err(StreamError::unsupported(format!(
                    "format {} is {}, not {}",
                    index, format.encoding, encoding
                )));
            }
            Ok(format)
        }
        (None, Some(encoding)) => formats
            .iter()
            .find(|f| f.encoding == encoding)
            .ok_or_else(|| StreamError::unsupported(format!("device offers no {} format", encoding))),
        (None, None) => {
            let format = formats
                .first()
                .ok_or_else(|| StreamError::unsupported("streaming interface has no formats"))?;
            info!(
                "format_index unset, using format {} ({})",
                format.index, format.encoding
            );
            Ok(format)
        }
    }
}

fn select_frame<'a>(
    request: &StreamRequest,
    format: &'a FormatDescriptor,
) -> Result<&'a FrameDescriptor, StreamError> {
    match (request.frame_index, request.width, request.height) {
        (Some(index), width, height) => {
            let frame = format.frame(index).ok_or_else(|| {
                StreamError::unsupported(format!(
                    "{} format has no frame with index {}",
                    format.encoding, index
                ))
            })?;
            let size_matches = width.map_or(true, |w| w == frame.width as u32)
                && height.map_or(true, |h| h == frame.height as u32);
            if !size_matches {
                return Err(StreamError::unsupported(format!(
                    "frame {} is {}x{}, not the requested size",
                    index, frame.width, frame.height
                )));
            }
            Ok(frame)
        }
        (None, Some(width), Some(height)) => format.frame_by_size(width, height).ok_or_else(|| {
            StreamError::unsupported(format!("{} {}x{}", format.encoding, width, height))
        }),
        (None, None, None) => {
            let frame = format
                .frame(format.default_frame_index)
                .or_else(|| format.frames.first())
                .ok_or_else(|| StreamError::unsupported("format has no frames"))?;
            info!(
                "frame_index unset, using default frame {} ({}x{})",
                frame.index, frame.width, frame.height
            );
            Ok(frame)
        }
        _ => Err(StreamError::unsupported(
            "width and height must be given together",
        )),
    }
}

fn default_interval(frame: &FrameDescriptor) -> u32 {
    if frame.intervals.supports(frame.default_interval) {
        return frame.default_interval;
    }
    match &frame.intervals {
        FrameIntervals::Discrete(list) => list.first().copied().unwrap_or(frame.default_interval),
        FrameIntervals::Continuous { min, .. } => *min,
    }
}

/// Fix the transport parameters once the device has answered the probe.
pub fn finalize(
    resolved: ResolvedRequest,
    catalog: &DeviceDescriptor,
    answer: &ProbeCommit,
) -> Result<StreamConfig, StreamError> {
    let iface = catalog
        .streaming_interface(resolved.interface)
        .ok_or_else(|| StreamError::unsupported("streaming interface vanished"))?;
    let max_payload = answer.max_payload_transfer_size as usize;

    let (transfer, alt_setting, endpoint, max_packet_size, packets_per_request) = if resolved.bulk {
        let ep = iface
            .bulk_endpoint()
            .ok_or_else(|| StreamError::unsupported("device has no bulk streaming endpoint"))?;
        let packet = resolved.max_packet_size.unwrap_or_else(|| ep.payload_capacity());
        if packet == 0 {
            return Err(StreamError::unsupported("bulk endpoint reports zero packet size"));
        }
        // One request must hold a whole payload transfer
        let packets = resolved
            .packets_per_request
            .max(max_payload.div_ceil(packet));
        (TransferKind::Bulk, 0, ep.address, packet, packets)
    } else {
        let alts = iface.isochronous_alts();
        let preferred = resolved
            .alt_setting
            .and_then(|a| alts.iter().find(|alt| alt.alt_setting == a));
        let alt = match (preferred, resolved.alt_setting) {
            (Some(alt), _) => *alt,
            (None, Some(a)) if !resolved.alt_is_hint => {
                return Err(StreamError::unsupported(format!(
                    "alternate setting {} has no isochronous endpoint",
                    a
                )))
            }
            _ => {
                let need = resolved.max_packet_size.unwrap_or(max_payload);
                let alt = alts
                    .iter()
                    .find(|a| a.payload_capacity() >= need)
                    .or_else(|| alts.last())
                    .ok_or_else(|| {
                        StreamError::unsupported("device has no isochronous alternate setting")
                    })?;
                info!(
                    "Selected alternate setting {} ({} bytes per interval) for {} byte payloads",
                    alt.alt_setting,
                    alt.payload_capacity(),
                    need
                );
                *alt
            }
        };
        let capacity = alt.payload_capacity();
        let packet = resolved.max_packet_size.unwrap_or(capacity);
        if packet < capacity {
            warn!(
                "Packet size {} is below the {} bytes alternate setting {} may deliver",
                packet, capacity, alt.alt_setting
            );
        }
        let endpoint = alt
            .endpoint
            .as_ref()
            .map(|ep| ep.address)
            .unwrap_or(resolved.endpoint);
        (
            TransferKind::Isochronous,
            alt.alt_setting,
            endpoint,
            packet,
            resolved.packets_per_request,
        )
    };

    if answer.frame_interval != resolved.frame_interval && answer.frame_interval != 0 {
        info!(
            "Device adjusted frame interval {} -> {}",
            resolved.frame_interval, answer.frame_interval
        );
    }
    let frame_interval = if answer.frame_interval != 0 {
        answer.frame_interval
    } else {
        resolved.frame_interval
    };
    let max_video_frame_size = if answer.max_video_frame_size != 0 {
        answer.max_video_frame_size
    } else {
        resolved.frame.max_frame_size
    };

    Ok(StreamConfig {
        interface: resolved.interface,
        format_index: resolved.format.index,
        frame_index: resolved.frame.index,
        encoding: resolved.format.encoding,
        width: resolved.frame.width as u32,
        height: resolved.frame.height as u32,
        bits_per_pixel: resolved.format.bits_per_pixel as u32,
        frame_interval,
        alt_setting,
        endpoint,
        transfer,
        max_packet_size,
        packets_per_request,
        active_urbs: resolved.active_urbs,
        max_video_frame_size,
        max_payload_transfer_size: answer.max_payload_transfer_size,
        uvc_version: resolved.uvc_version,
        unit_id: resolved.unit_id,
        terminal_id: resolved.terminal_id,
        control_terminal: resolved.control_terminal,
        control_unit: resolved.control_unit,
        still_capture_method: resolved.still_capture_method,
    })
}
