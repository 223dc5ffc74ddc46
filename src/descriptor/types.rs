//! Parsed device catalog.

use std::fmt;

use serde::Serialize;

use crate::capture::frame::Encoding;

/// Everything the stream controller needs to know about a UVC device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdUSB
    pub usb_version: u16,
    /// bcdUVC from the video control header
    pub uvc_version: u16,
    pub control: VideoControl,
    pub streaming: Vec<StreamingInterface>,
}

impl DeviceDescriptor {
    pub fn streaming_interface(&self, number: u8) -> Option<&StreamingInterface> {
        self.streaming.iter().find(|s| s.interface == number)
    }
}

/// Video control interface topology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VideoControl {
    pub interface: u8,
    pub clock_frequency: u32,
    pub input_terminals: Vec<InputTerminal>,
    pub output_terminals: Vec<OutputTerminal>,
    pub selector_units: Vec<SelectorUnit>,
    pub processing_units: Vec<ProcessingUnit>,
    pub extension_units: Vec<ExtensionUnit>,
}

impl VideoControl {
    /// The camera (ITT_CAMERA) input terminal, if any.
    pub fn camera_terminal(&self) -> Option<&InputTerminal> {
        self.input_terminals
            .iter()
            .find(|t| t.terminal_type == TERMINAL_TYPE_CAMERA)
    }
}

pub const TERMINAL_TYPE_CAMERA: u16 = 0x0201;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputTerminal {
    pub id: u8,
    pub terminal_type: u16,
    /// bmControls (camera terminals only)
    pub controls: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputTerminal {
    pub id: u8,
    pub terminal_type: u16,
    pub source_id: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectorUnit {
    pub id: u8,
    pub sources: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingUnit {
    pub id: u8,
    pub source_id: u8,
    pub controls: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionUnit {
    pub id: u8,
    pub guid: [u8; 16],
    pub num_controls: u8,
    pub sources: Vec<u8>,
    pub controls: Vec<u8>,
}

/// A video streaming interface and everything declared under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamingInterface {
    pub interface: u8,
    /// bEndpointAddress from the input header
    pub endpoint_address: u8,
    pub terminal_link: u8,
    pub still_capture_method: u8,
    pub formats: Vec<FormatDescriptor>,
    pub alt_settings: Vec<AltSetting>,
}

impl StreamingInterface {
    pub fn format(&self, index: u8) -> Option<&FormatDescriptor> {
        self.formats.iter().find(|f| f.index == index)
    }

    pub fn alt_setting(&self, alt: u8) -> Option<&AltSetting> {
        self.alt_settings.iter().find(|a| a.alt_setting == alt)
    }

    /// Bulk endpoint on alternate setting 0, if the device streams over bulk.
    pub fn bulk_endpoint(&self) -> Option<&EndpointInfo> {
        self.alt_setting(0)
            .and_then(|a| a.endpoint.as_ref())
            .filter(|ep| ep.kind == EndpointKind::Bulk)
    }

    /// Alternate settings carrying an isochronous endpoint, by ascending
    /// payload capacity.
    pub fn isochronous_alts(&self) -> Vec<&AltSetting> {
        let mut alts: Vec<&AltSetting> = self
            .alt_settings
            .iter()
            .filter(|a| {
                a.endpoint
                    .as_ref()
                    .is_some_and(|ep| ep.kind == EndpointKind::Isochronous)
            })
            .collect();
        alts.sort_by_key(|a| a.payload_capacity());
        alts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AltSetting {
    pub alt_setting: u8,
    pub endpoint: Option<EndpointInfo>,
}

impl AltSetting {
    pub fn payload_capacity(&self) -> usize {
        self.endpoint
            .as_ref()
            .map(|ep| ep.payload_capacity())
            .unwrap_or(0)
    }
}

/// USB endpoint transfer types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointKind {
    pub fn from_attributes(bm_attributes: u8) -> Self {
        match bm_attributes & 0x03 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointInfo {
    pub address: u8,
    pub kind: EndpointKind,
    /// Raw wMaxPacketSize, multiplier bits included.
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointInfo {
    /// Base packet size (bits 10:0 of wMaxPacketSize).
    pub fn base_packet_size(&self) -> usize {
        (self.max_packet_size & 0x07FF) as usize
    }

    /// Additional transactions per microframe (bits 12:11), as 1, 2 or 3.
    pub fn multiplier(&self) -> usize {
        let mult_bits = (self.max_packet_size >> 11) & 0x03;
        if mult_bits == 0 {
            1
        } else {
            mult_bits as usize + 1
        }
    }

    /// Bytes per service interval.
    pub fn payload_capacity(&self) -> usize {
        self.base_packet_size() * self.multiplier()
    }

    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatDescriptor {
    pub index: u8,
    pub encoding: Encoding,
    pub bits_per_pixel: u8,
    pub default_frame_index: u8,
    pub frames: Vec<FrameDescriptor>,
}

impl FormatDescriptor {
    pub fn frame(&self, index: u8) -> Option<&FrameDescriptor> {
        self.frames.iter().find(|f| f.index == index)
    }

    pub fn frame_by_size(&self, width: u32, height: u32) -> Option<&FrameDescriptor> {
        self.frames
            .iter()
            .find(|f| f.width as u32 == width && f.height as u32 == height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameDescriptor {
    pub index: u8,
    pub width: u16,
    pub height: u16,
    /// dwMaxVideoFrameBufferSize; 0 for frame-based formats
    pub max_frame_size: u32,
    pub default_interval: u32,
    pub intervals: FrameIntervals,
}

/// Supported frame intervals, in 100 ns units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FrameIntervals {
    Discrete(Vec<u32>),
    Continuous { min: u32, max: u32, step: u32 },
}

impl FrameIntervals {
    pub fn supports(&self, interval: u32) -> bool {
        match self {
            Self::Discrete(list) => list.contains(&interval),
            Self::Continuous { min, max, step } => {
                interval >= *min
                    && interval <= *max
                    && (*step == 0 || (interval - min) % step == 0)
            }
        }
    }
}

impl fmt::Display for FrameIntervals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discrete(list) => write!(f, "{:?}", list),
            Self::Continuous { min, max, step } => write!(f, "{}..={} step {}", min, max, step),
        }
    }
}
