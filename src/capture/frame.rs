use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// GUID suffix shared by all FourCC-based UVC format GUIDs
/// (`XXXXXXXX-0000-0010-8000-00AA00389B71`).
const GUID_SUFFIX: [u8; 12] = [
    0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71,
];

/// Builds the format GUID for a FourCC.
pub const fn fourcc_guid(fourcc: [u8; 4]) -> [u8; 16] {
    let mut guid = [0u8; 16];
    let mut i = 0;
    while i < 4 {
        guid[i] = fourcc[i];
        i += 1;
    }
    while i < 16 {
        guid[i] = GUID_SUFFIX[i - 4];
        i += 1;
    }
    guid
}

/// Stream encodings a format descriptor can announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Mjpeg,
    Yuy2,
    Uyvy,
    Nv12,
    Grey,
    /// Uncompressed format with an unrecognized GUID.
    Uncompressed([u8; 16]),
    /// Frame-based format (H.264 and friends).
    FrameBased([u8; 16]),
}

impl Encoding {
    /// Classify an uncompressed-format GUID.
    pub fn from_uncompressed_guid(guid: [u8; 16]) -> Self {
        if guid[4..] != GUID_SUFFIX {
            return Self::Uncompressed(guid);
        }
        match &guid[..4] {
            b"YUY2" | b"YUYV" => Self::Yuy2,
            b"UYVY" => Self::Uyvy,
            b"NV12" => Self::Nv12,
            b"Y800" | b"GREY" => Self::Grey,
            _ => Self::Uncompressed(guid),
        }
    }

    /// GUID as it appears in an uncompressed/frame-based format descriptor.
    pub fn guid(&self) -> Option<[u8; 16]> {
        match self {
            Self::Mjpeg => None,
            Self::Yuy2 => Some(fourcc_guid(*b"YUY2")),
            Self::Uyvy => Some(fourcc_guid(*b"UYVY")),
            Self::Nv12 => Some(fourcc_guid(*b"NV12")),
            Self::Grey => Some(fourcc_guid(*b"Y800")),
            Self::Uncompressed(guid) | Self::FrameBased(guid) => Some(*guid),
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::Mjpeg | Self::FrameBased(_))
    }

    /// Bits per pixel for the recognized raw encodings.
    pub fn bits_per_pixel(&self) -> Option<u32> {
        match self {
            Self::Yuy2 | Self::Uyvy => Some(16),
            Self::Nv12 => Some(12),
            Self::Grey => Some(8),
            _ => None,
        }
    }

    /// Pixel layout a raw encoding is delivered in without conversion.
    pub fn native_pixel_format(&self) -> Option<PixelFormat> {
        match self {
            Self::Yuy2 => Some(PixelFormat::Yuyv),
            Self::Uyvy => Some(PixelFormat::Uyvy),
            Self::Nv12 => Some(PixelFormat::Nv12),
            Self::Grey => Some(PixelFormat::Grey),
            Self::Uncompressed(_) => Some(PixelFormat::Raw),
            Self::Mjpeg | Self::FrameBased(_) => None,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mjpeg => write!(f, "MJPEG"),
            Self::Yuy2 => write!(f, "YUY2"),
            Self::Uyvy => write!(f, "UYVY"),
            Self::Nv12 => write!(f, "NV12"),
            Self::Grey => write!(f, "GREY"),
            Self::Uncompressed(guid) | Self::FrameBased(guid) => {
                let tag: String = guid[..4]
                    .iter()
                    .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
                    .collect();
                write!(f, "{}", tag)
            }
        }
    }
}

/// Pixel formats of decoded frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Yuyv,
    Uyvy,
    Nv12,
    Grey,
    /// Uncompressed payload passed through untouched.
    Raw,
}

/// Geometry of the negotiated stream, shared by reassembly and decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub encoding: Encoding,
    pub width: u32,
    pub height: u32,
    /// From the format descriptor; 0 for MJPEG
    pub bits_per_pixel: u32,
    /// dwMaxVideoFrameSize from the committed probe, when known
    pub max_frame_size: Option<usize>,
}

impl FrameLayout {
    /// Exact byte size of one uncompressed frame.
    pub fn expected_size(&self) -> Option<usize> {
        if self.encoding.is_compressed() {
            return None;
        }
        let bpp = self
            .encoding
            .bits_per_pixel()
            .unwrap_or(self.bits_per_pixel) as usize;
        if bpp == 0 {
            return None;
        }
        Some(self.width as usize * self.height as usize * bpp / 8)
    }
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub encoding: Encoding,
    /// dwPresentationTime of the first payload, in device clock ticks.
    pub presentation_time: Option<u32>,
}

/// A reassembled frame awaiting decode.
#[derive(Debug, Clone)]
pub struct CompletedFrame {
    /// Concatenated payload data, headers stripped
    pub data: Bytes,

    pub meta: FrameMetadata,

    /// Arrival of the first payload, for latency tracking
    pub timestamp: Instant,
}

/// A frame ready for the host application.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// Bytes per row of the first plane
    pub stride: u32,
    pub format: PixelFormat,
    pub sequence: u64,
    pub presentation_time: Option<u32>,
    pub timestamp: Instant,
}
