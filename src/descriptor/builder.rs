//! Serializer for synthetic UVC configuration descriptors.
//!
//! Produces the byte layout real cameras report: configuration header,
//! interface association, video control interface with a camera terminal →
//! processing unit → extension unit → output terminal chain, and one video
//! streaming interface with its formats, frames and alternate settings.

use super::parser::*;
use super::types::FrameIntervals;
use crate::capture::frame::Encoding;

const VC_INTERFACE: u8 = 0;
const VS_INTERFACE: u8 = 1;
const CAMERA_TERMINAL_ID: u8 = 1;
const PROCESSING_UNIT_ID: u8 = 2;
const OUTPUT_TERMINAL_ID: u8 = 3;
const EXTENSION_UNIT_ID: u8 = 4;

const EXTENSION_GUID: [u8; 16] = [
    0x41, 0x76, 0x9E, 0xA2, 0x04, 0xDE, 0xE3, 0x47, 0x8B, 0x2B, 0xF4, 0x34, 0x1A, 0xFF, 0x00, 0x3B,
];

#[derive(Debug, Clone)]
pub struct FrameSpec {
    pub width: u16,
    pub height: u16,
    pub intervals: FrameIntervals,
}

impl FrameSpec {
    /// Discrete intervals; the first one is the default.
    pub fn new(width: u16, height: u16, intervals: Vec<u32>) -> Self {
        Self {
            width,
            height,
            intervals: FrameIntervals::Discrete(intervals),
        }
    }

    pub fn continuous(width: u16, height: u16, min: u32, max: u32, step: u32) -> Self {
        Self {
            width,
            height,
            intervals: FrameIntervals::Continuous { min, max, step },
        }
    }

    pub fn default_interval(&self) -> u32 {
        match &self.intervals {
            FrameIntervals::Discrete(list) => list.first().copied().unwrap_or(333_333),
            FrameIntervals::Continuous { min, .. } => *min,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FormatSpec {
    pub encoding: Encoding,
    pub frames: Vec<FrameSpec>,
}

impl FormatSpec {
    pub fn new(encoding: Encoding, frames: Vec<FrameSpec>) -> Self {
        Self { encoding, frames }
    }

    fn bits_per_pixel(&self) -> u8 {
        self.encoding.bits_per_pixel().unwrap_or(16) as u8
    }

    /// dwMaxVideoFrameBufferSize advertised for `frame`.
    pub fn max_frame_size(&self, frame: &FrameSpec) -> u32 {
        let pixels = frame.width as u32 * frame.height as u32;
        match self.encoding {
            Encoding::Mjpeg => pixels * 2,
            Encoding::FrameBased(_) => 0,
            _ => pixels * self.bits_per_pixel() as u32 / 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigurationBuilder {
    uvc_version: u16,
    endpoint: u8,
    bulk_packet_size: Option<u16>,
    iso_packet_sizes: Vec<u16>,
    formats: Vec<FormatSpec>,
}

impl Default for ConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigurationBuilder {
    /// UVC 1.1 device, isochronous endpoint 0x81 with one 1024-byte alt.
    pub fn new() -> Self {
        Self {
            uvc_version: 0x0110,
            endpoint: 0x81,
            bulk_packet_size: None,
            iso_packet_sizes: vec![1024],
            formats: Vec::new(),
        }
    }

    /// A typical webcam: YUY2 (format 1) and MJPEG (format 2), five
    /// isochronous alternate settings from 128 to 3×1024 bytes.
    pub fn webcam() -> Self {
        let intervals = vec![333_333, 666_666, 1_000_000];
        Self::new()
            .iso_alts(&[128, 512, 1024, 0x0800 | 1024, 0x1000 | 1024])
            .format(FormatSpec::new(
                Encoding::Yuy2,
                vec![
                    FrameSpec::new(640, 480, intervals.clone()),
                    FrameSpec::new(800, 600, intervals.clone()),
                ],
            ))
            .format(FormatSpec::new(
                Encoding::Mjpeg,
                vec![
                    FrameSpec::new(640, 480, intervals.clone()),
                    FrameSpec::new(800, 600, intervals.clone()),
                    FrameSpec::new(1280, 720, intervals),
                ],
            ))
    }

    pub fn uvc_version(mut self, bcd: u16) -> Self {
        self.uvc_version = bcd;
        self
    }

    pub fn endpoint(mut self, address: u8) -> Self {
        self.endpoint = address;
        self
    }

    /// Stream over a bulk endpoint on alt 0 instead of isochronous alts.
    pub fn bulk(mut self, packet_size: u16) -> Self {
        self.bulk_packet_size = Some(packet_size);
        self.iso_packet_sizes.clear();
        self
    }

    /// Raw wMaxPacketSize of alternate settings 1..=n.
    pub fn iso_alts(mut self, sizes: &[u16]) -> Self {
        self.iso_packet_sizes = sizes.to_vec();
        self.bulk_packet_size = None;
        self
    }

    pub fn format(mut self, format: FormatSpec) -> Self {
        self.formats.push(format);
        self
    }

    /// bcdUVC
    pub fn version(&self) -> u16 {
        self.uvc_version
    }

    pub fn formats(&self) -> &[FormatSpec] {
        &self.formats
    }

    pub fn streaming_interface(&self) -> u8 {
        VS_INTERFACE
    }

    /// Looks up a format/frame pair by their 1-based descriptor indices.
    pub fn lookup(&self, format_index: u8, frame_index: u8) -> Option<(&FormatSpec, &FrameSpec)> {
        let format = self.formats.get((format_index as usize).checked_sub(1)?)?;
        let frame = format.frames.get((frame_index as usize).checked_sub(1)?)?;
        Some((format, frame))
    }

    /// 18-byte standard device descriptor (USB 2.0, miscellaneous/IAD class).
    pub fn device_descriptor(vendor_id: u16, product_id: u16) -> Vec<u8> {
        let mut out = vec![18, DT_DEVICE, 0x00, 0x02, 0xEF, 0x02, 0x01, 64];
        out.extend_from_slice(&vendor_id.to_le_bytes());
        out.extend_from_slice(&product_id.to_le_bytes());
        out.extend_from_slice(&[0x00, 0x01, 1, 2, 0, 1]);
        out
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = vec![9, DT_CONFIGURATION, 0, 0, 2, 1, 0, 0x80, 250];
        out.extend_from_slice(&[8, DT_INTERFACE_ASSOCIATION, VC_INTERFACE, 2, CLASS_VIDEO, 0x03, 0, 0]);

        self.video_control(&mut out);
        self.video_streaming(&mut out);

        let total = out.len() as u16;
        out[2..4].copy_from_slice(&total.to_le_bytes());
        out
    }

    fn video_control(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[9, DT_INTERFACE, VC_INTERFACE, 0, 1, CLASS_VIDEO, SUBCLASS_VIDEO_CONTROL, 0, 0]);

        let mut cs = Vec::new();
        let bcd = self.uvc_version.to_le_bytes();
        cs.extend_from_slice(&[13, DT_CS_INTERFACE, VC_HEADER, bcd[0], bcd[1], 0, 0]);
        cs.extend_from_slice(&48_000_000u32.to_le_bytes());
        cs.extend_from_slice(&[1, VS_INTERFACE]);

        cs.extend_from_slice(&[
            18, DT_CS_INTERFACE, VC_INPUT_TERMINAL, CAMERA_TERMINAL_ID, 0x01, 0x02, 0, 0,
            0, 0, 0, 0, 0, 0, 3, 0x0A, 0x00, 0x00,
        ]);
        cs.extend_from_slice(&[
            11, DT_CS_INTERFACE, VC_PROCESSING_UNIT, PROCESSING_UNIT_ID, CAMERA_TERMINAL_ID,
            0, 0, 2, 0x7F, 0x15, 0,
        ]);
        cs.extend_from_slice(&[26, DT_CS_INTERFACE, VC_EXTENSION_UNIT, EXTENSION_UNIT_ID]);
        cs.extend_from_slice(&EXTENSION_GUID);
        cs.extend_from_slice(&[2, 1, PROCESSING_UNIT_ID, 1, 0x03, 0]);
        cs.extend_from_slice(&[
            9, DT_CS_INTERFACE, VC_OUTPUT_TERMINAL, OUTPUT_TERMINAL_ID, 0x01, 0x01, 0,
            EXTENSION_UNIT_ID, 0,
        ]);

        let total = cs.len() as u16;
        cs[5..7].copy_from_slice(&total.to_le_bytes());
        out.extend_from_slice(&cs);

        // status interrupt endpoint
        out.extend_from_slice(&[7, DT_ENDPOINT, 0x83, 0x03, 16, 0, 8]);
        out.extend_from_slice(&[5, DT_CS_ENDPOINT, 0x03, 16, 0]);
    }

    fn video_streaming(&self, out: &mut Vec<u8>) {
        let bulk_endpoints = u8::from(self.bulk_packet_size.is_some());
        out.extend_from_slice(&[9, DT_INTERFACE, VS_INTERFACE, 0, bulk_endpoints, CLASS_VIDEO, SUBCLASS_VIDEO_STREAMING, 0, 0]);

        let mut cs = Vec::new();
        let formats = self.formats.len() as u8;
        cs.extend_from_slice(&[
            13 + formats, DT_CS_INTERFACE, VS_INPUT_HEADER, formats, 0, 0, self.endpoint, 0,
            OUTPUT_TERMINAL_ID, 2, 0, 0, 1,
        ]);
        cs.extend(std::iter::repeat(0u8).take(formats as usize));

        for (i, format) in self.formats.iter().enumerate() {
            let index = i as u8 + 1;
            let frames = format.frames.len() as u8;
            let frame_subtype = match format.encoding {
                Encoding::Mjpeg => {
                    cs.extend_from_slice(&[11, DT_CS_INTERFACE, VS_FORMAT_MJPEG, index, frames, 1, 1, 0, 0, 0, 0]);
                    VS_FRAME_MJPEG
                }
                Encoding::FrameBased(guid) => {
                    cs.extend_from_slice(&[28, DT_CS_INTERFACE, VS_FORMAT_FRAME_BASED, index, frames]);
                    cs.extend_from_slice(&guid);
                    cs.extend_from_slice(&[format.bits_per_pixel(), 1, 0, 0, 0, 0, 1]);
                    VS_FRAME_FRAME_BASED
                }
                other => {
                    let guid = other.guid().unwrap_or_default();
                    cs.extend_from_slice(&[27, DT_CS_INTERFACE, VS_FORMAT_UNCOMPRESSED, index, frames]);
                    cs.extend_from_slice(&guid);
                    cs.extend_from_slice(&[format.bits_per_pixel(), 1, 0, 0, 0, 0]);
                    VS_FRAME_UNCOMPRESSED
                }
            };

            for (j, frame) in format.frames.iter().enumerate() {
                encode_frame(&mut cs, format, frame, j as u8 + 1, frame_subtype);
            }
            cs.extend_from_slice(&[6, DT_CS_INTERFACE, VS_COLORFORMAT, 1, 1, 4]);
        }

        let total = cs.len() as u16;
        cs[4..6].copy_from_slice(&total.to_le_bytes());
        out.extend_from_slice(&cs);

        if let Some(size) = self.bulk_packet_size {
            let size = size.to_le_bytes();
            out.extend_from_slice(&[7, DT_ENDPOINT, self.endpoint, 0x02, size[0], size[1], 0]);
        }
        for (alt, size) in self.iso_packet_sizes.iter().enumerate() {
            let size = size.to_le_bytes();
            out.extend_from_slice(&[9, DT_INTERFACE, VS_INTERFACE, alt as u8 + 1, 1, CLASS_VIDEO, SUBCLASS_VIDEO_STREAMING, 0, 0]);
            out.extend_from_slice(&[7, DT_ENDPOINT, self.endpoint, 0x05, size[0], size[1], 1]);
        }
    }
}

fn encode_frame(out: &mut Vec<u8>, format: &FormatSpec, frame: &FrameSpec, index: u8, subtype: u8) {
    let (interval_type, intervals): (u8, Vec<u32>) = match &frame.intervals {
        FrameIntervals::Discrete(list) => (list.len() as u8, list.clone()),
        FrameIntervals::Continuous { min, max, step } => (0, vec![*min, *max, *step]),
    };
    let len = 26 + intervals.len() * 4;
    let pixels = frame.width as u32 * frame.height as u32;
    let bitrate = pixels * 16 * 30;

    out.extend_from_slice(&[len as u8, DT_CS_INTERFACE, subtype, index, 0]);
    out.extend_from_slice(&frame.width.to_le_bytes());
    out.extend_from_slice(&frame.height.to_le_bytes());
    out.extend_from_slice(&(bitrate / 4).to_le_bytes());
    out.extend_from_slice(&bitrate.to_le_bytes());
    if subtype == VS_FRAME_FRAME_BASED {
        out.extend_from_slice(&frame.default_interval().to_le_bytes());
        out.push(interval_type);
        out.extend_from_slice(&0u32.to_le_bytes());
    } else {
        out.extend_from_slice(&format.max_frame_size(frame).to_le_bytes());
        out.extend_from_slice(&frame.default_interval().to_le_bytes());
        out.push(interval_type);
    }
    for interval in intervals {
        out.extend_from_slice(&interval.to_le_bytes());
    }
}
