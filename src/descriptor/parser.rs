//! Single-pass parser for USB/UVC descriptor blocks.
//!
//! Every entry is `[bLength, bDescriptorType, payload...]`. The current
//! standard interface descriptor decides how class-specific entries that
//! follow it are interpreted; anything unrecognized but well-formed is
//! skipped by its declared length.

use tracing::{debug, trace};

use super::types::*;
use crate::capture::frame::Encoding;
use crate::error::DescriptorError;

pub const DT_DEVICE: u8 = 0x01;
pub const DT_CONFIGURATION: u8 = 0x02;
pub const DT_INTERFACE: u8 = 0x04;
pub const DT_ENDPOINT: u8 = 0x05;
pub const DT_INTERFACE_ASSOCIATION: u8 = 0x0B;
pub const DT_CS_INTERFACE: u8 = 0x24;
pub const DT_CS_ENDPOINT: u8 = 0x25;

pub const CLASS_VIDEO: u8 = 0x0E;
pub const SUBCLASS_VIDEO_CONTROL: u8 = 0x01;
pub const SUBCLASS_VIDEO_STREAMING: u8 = 0x02;

pub const VC_HEADER: u8 = 0x01;
pub const VC_INPUT_TERMINAL: u8 = 0x02;
pub const VC_OUTPUT_TERMINAL: u8 = 0x03;
pub const VC_SELECTOR_UNIT: u8 = 0x04;
pub const VC_PROCESSING_UNIT: u8 = 0x05;
pub const VC_EXTENSION_UNIT: u8 = 0x06;

pub const VS_INPUT_HEADER: u8 = 0x01;
pub const VS_STILL_IMAGE_FRAME: u8 = 0x03;
pub const VS_FORMAT_UNCOMPRESSED: u8 = 0x04;
pub const VS_FRAME_UNCOMPRESSED: u8 = 0x05;
pub const VS_FORMAT_MJPEG: u8 = 0x06;
pub const VS_FRAME_MJPEG: u8 = 0x07;
pub const VS_COLORFORMAT: u8 = 0x0D;
pub const VS_FORMAT_FRAME_BASED: u8 = 0x10;
pub const VS_FRAME_FRAME_BASED: u8 = 0x11;

const DEVICE_DESCRIPTOR_LEN: usize = 18;

/// Identity fields from the standard device descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIds {
    pub vendor_id: u16,
    pub product_id: u16,
    pub usb_version: u16,
}

pub fn parse_device_descriptor(bytes: &[u8]) -> Result<DeviceIds, DescriptorError> {
    if bytes.len() < DEVICE_DESCRIPTOR_LEN || (bytes[0] as usize) < DEVICE_DESCRIPTOR_LEN {
        return Err(DescriptorError::new(0, "device descriptor shorter than 18 bytes"));
    }
    if bytes[1] != DT_DEVICE {
        return Err(DescriptorError::new(
            1,
            format!("expected device descriptor, found type 0x{:02x}", bytes[1]),
        ));
    }
    Ok(DeviceIds {
        usb_version: le16(bytes, 2),
        vendor_id: le16(bytes, 8),
        product_id: le16(bytes, 10),
    })
}

/// Parse the device descriptor and the configuration descriptor block.
pub fn parse(device: &[u8], configuration: &[u8]) -> Result<DeviceDescriptor, DescriptorError> {
    let ids = parse_device_descriptor(device)?;
    let mut catalog = parse_configuration(configuration)?;
    catalog.vendor_id = ids.vendor_id;
    catalog.product_id = ids.product_id;
    catalog.usb_version = ids.usb_version;
    Ok(catalog)
}

/// Parse a configuration descriptor block. Vendor/product fields are left
/// zero; [`parse`] fills them in.
pub fn parse_configuration(bytes: &[u8]) -> Result<DeviceDescriptor, DescriptorError> {
    let mut parser = Parser::default();
    let mut offset = 0;

    while offset < bytes.len() {
        let remaining = bytes.len() - offset;
        if remaining < 2 {
            return Err(DescriptorError::new(offset, "trailing byte after last descriptor"));
        }
        let len = bytes[offset] as usize;
        if len < 2 {
            return Err(DescriptorError::new(offset, format!("bLength {} too small", len)));
        }
        if len > remaining {
            return Err(DescriptorError::new(
                offset,
                format!("bLength {} exceeds remaining {} bytes", len, remaining),
            ));
        }
        let entry = Entry {
            offset,
            bytes: &bytes[offset..offset + len],
        };
        if offset == 0 && entry.kind() != DT_CONFIGURATION {
            return Err(DescriptorError::new(
                0,
                format!(
                    "expected configuration descriptor, found type 0x{:02x}",
                    entry.kind()
                ),
            ));
        }
        parser.entry(entry)?;
        offset += len;
    }

    parser.finish(bytes.len())
}

#[derive(Clone, Copy)]
struct Entry<'a> {
    offset: usize,
    bytes: &'a [u8],
}

impl<'a> Entry<'a> {
    fn kind(&self) -> u8 {
        self.bytes[1]
    }

    fn subtype(&self) -> Option<u8> {
        self.bytes.get(2).copied()
    }

    fn require(&self, min: usize, what: &str) -> Result<(), DescriptorError> {
        if self.bytes.len() < min {
            return Err(DescriptorError::new(
                self.offset,
                format!("{} needs {} bytes, bLength is {}", what, min, self.bytes.len()),
            ));
        }
        Ok(())
    }

    fn u8(&self, at: usize) -> u8 {
        self.bytes[at]
    }

    fn u16(&self, at: usize) -> u16 {
        le16(self.bytes, at)
    }

    fn u32(&self, at: usize) -> u32 {
        le32(self.bytes, at)
    }

    fn slice(&self, at: usize, len: usize) -> &'a [u8] {
        &self.bytes[at..at + len]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    None,
    VideoControl,
    /// Index into `Parser::streaming` and into its `alt_settings`.
    VideoStreaming { stream: usize, alt: usize },
    Other,
}

struct Parser {
    context: Context,
    control: Option<VideoControl>,
    uvc_version: u16,
    streaming: Vec<StreamingInterface>,
}

impl Default for Parser {
    fn default() -> Self {
        Self {
            context: Context::None,
            control: None,
            uvc_version: 0,
            streaming: Vec::new(),
        }
    }
}

impl Parser {
    fn entry(&mut self, entry: Entry<'_>) -> Result<(), DescriptorError> {
        match entry.kind() {
            DT_CONFIGURATION => {
                entry.require(9, "configuration descriptor")?;
                trace!(
                    "Configuration {} with {} interfaces",
                    entry.u8(5),
                    entry.u8(4)
                );
                Ok(())
            }
            DT_INTERFACE => self.interface(entry),
            DT_ENDPOINT => self.endpoint(entry),
            DT_CS_INTERFACE => match self.context {
                Context::VideoControl => self.video_control(entry),
                Context::VideoStreaming { stream, .. } => self.video_streaming(stream, entry),
                _ => Ok(()),
            },
            DT_INTERFACE_ASSOCIATION | DT_CS_ENDPOINT => Ok(()),
            other => {
                trace!(
                    "Skipping descriptor type 0x{:02x} at offset {}",
                    other,
                    entry.offset
                );
                Ok(())
            }
        }
    }

    fn interface(&mut self, entry: Entry<'_>) -> Result<(), DescriptorError> {
        entry.require(9, "interface descriptor")?;
        let number = entry.u8(2);
        let alt = entry.u8(3);
        let class = entry.u8(5);
        let subclass = entry.u8(6);

        self.context = match (class, subclass) {
            (CLASS_VIDEO, SUBCLASS_VIDEO_CONTROL) => {
                let control = self.control.get_or_insert_with(VideoControl::default);
                control.interface = number;
                Context::VideoControl
            }
            (CLASS_VIDEO, SUBCLASS_VIDEO_STREAMING) => {
                let stream = match self.streaming.iter().position(|s| s.interface == number) {
                    Some(i) => i,
                    None => {
                        self.streaming.push(StreamingInterface {
                            interface: number,
                            endpoint_address: 0,
                            terminal_link: 0,
                            still_capture_method: 0,
                            formats: Vec::new(),
                            alt_settings: Vec::new(),
                        });
                        self.streaming.len() - 1
                    }
                };
                let alts = &mut self.streaming[stream].alt_settings;
                alts.push(AltSetting {
                    alt_setting: alt,
                    endpoint: None,
                });
                Context::VideoStreaming {
                    stream,
                    alt: alts.len() - 1,
                }
            }
            _ => Context::Other,
        };
        Ok(())
    }

    fn endpoint(&mut self, entry: Entry<'_>) -> Result<(), DescriptorError> {
        entry.require(7, "endpoint descriptor")?;
        if let Context::VideoStreaming { stream, alt } = self.context {
            let info = EndpointInfo {
                address: entry.u8(2),
                kind: EndpointKind::from_attributes(entry.u8(3)),
                max_packet_size: entry.u16(4),
                interval: entry.u8(6),
            };
            let slot = &mut self.streaming[stream].alt_settings[alt].endpoint;
            // Streaming endpoint wins over any other endpoint on the same alt.
            if slot.is_none() || info.is_in() {
                *slot = Some(info);
            }
        }
        Ok(())
    }

    fn video_control(&mut self, entry: Entry<'_>) -> Result<(), DescriptorError> {
        let Some(subtype) = entry.subtype() else {
            return Err(DescriptorError::new(entry.offset, "class-specific entry without subtype"));
        };
        let control = self.control.get_or_insert_with(VideoControl::default);

        match subtype {
            VC_HEADER => {
                entry.require(12, "VC header")?;
                self.uvc_version = entry.u16(3);
                control.clock_frequency = entry.u32(7);
            }
            VC_INPUT_TERMINAL => {
                entry.require(8, "input terminal")?;
                let terminal_type = entry.u16(4);
                let mut controls = Vec::new();
                if terminal_type == TERMINAL_TYPE_CAMERA {
                    entry.require(15, "camera terminal")?;
                    let size = entry.u8(14) as usize;
                    entry.require(15 + size, "camera terminal controls")?;
                    controls = entry.slice(15, size).to_vec();
                }
                control.input_terminals.push(InputTerminal {
                    id: entry.u8(3),
                    terminal_type,
                    controls,
                });
            }
            VC_OUTPUT_TERMINAL => {
                entry.require(9, "output terminal")?;
                control.output_terminals.push(OutputTerminal {
                    id: entry.u8(3),
                    terminal_type: entry.u16(4),
                    source_id: entry.u8(7),
                });
            }
            VC_SELECTOR_UNIT => {
                entry.require(5, "selector unit")?;
                let pins = entry.u8(4) as usize;
                entry.require(5 + pins, "selector unit sources")?;
                control.selector_units.push(SelectorUnit {
                    id: entry.u8(3),
                    sources: entry.slice(5, pins).to_vec(),
                });
            }
            VC_PROCESSING_UNIT => {
                entry.require(8, "processing unit")?;
                let size = entry.u8(7) as usize;
                entry.require(8 + size, "processing unit controls")?;
                control.processing_units.push(ProcessingUnit {
                    id: entry.u8(3),
                    source_id: entry.u8(4),
                    controls: entry.slice(8, size).to_vec(),
                });
            }
            VC_EXTENSION_UNIT => {
                entry.require(22, "extension unit")?;
                let pins = entry.u8(21) as usize;
                entry.require(23 + pins, "extension unit sources")?;
                let size = entry.u8(22 + pins) as usize;
                entry.require(23 + pins + size, "extension unit controls")?;
                let mut guid = [0u8; 16];
                guid.copy_from_slice(entry.slice(4, 16));
                control.extension_units.push(ExtensionUnit {
                    id: entry.u8(3),
                    guid,
                    num_controls: entry.u8(20),
                    sources: entry.slice(22, pins).to_vec(),
                    controls: entry.slice(23 + pins, size).to_vec(),
                });
            }
            other => trace!("Skipping VC subtype 0x{:02x}", other),
        }
        Ok(())
    }

    fn video_streaming(&mut self, stream: usize, entry: Entry<'_>) -> Result<(), DescriptorError> {
        let Some(subtype) = entry.subtype() else {
            return Err(DescriptorError::new(entry.offset, "class-specific entry without subtype"));
        };
        let iface = &mut self.streaming[stream];

        match subtype {
            VS_INPUT_HEADER => {
                entry.require(13, "VS input header")?;
                iface.endpoint_address = entry.u8(6);
                iface.terminal_link = entry.u8(8);
                iface.still_capture_method = entry.u8(9);
            }
            VS_FORMAT_UNCOMPRESSED | VS_FORMAT_FRAME_BASED => {
                let min = if subtype == VS_FORMAT_UNCOMPRESSED { 27 } else { 28 };
                entry.require(min, "format descriptor")?;
                let mut guid = [0u8; 16];
                guid.copy_from_slice(entry.slice(5, 16));
                let encoding = if subtype == VS_FORMAT_UNCOMPRESSED {
                    Encoding::from_uncompressed_guid(guid)
                } else {
                    Encoding::FrameBased(guid)
                };
                push_format(iface, &entry, encoding, entry.u8(21), entry.u8(22))?;
            }
            VS_FORMAT_MJPEG => {
                entry.require(11, "MJPEG format descriptor")?;
                push_format(iface, &entry, Encoding::Mjpeg, 0, entry.u8(6))?;
            }
            VS_FRAME_UNCOMPRESSED | VS_FRAME_MJPEG | VS_FRAME_FRAME_BASED => {
                let Some(format) = iface.formats.last_mut() else {
                    return Err(DescriptorError::new(
                        entry.offset,
                        "frame descriptor before any format descriptor",
                    ));
                };
                let expected = match format.encoding {
                    Encoding::Mjpeg => VS_FRAME_MJPEG,
                    Encoding::FrameBased(_) => VS_FRAME_FRAME_BASED,
                    _ => VS_FRAME_UNCOMPRESSED,
                };
                if subtype != expected {
                    return Err(DescriptorError::new(
                        entry.offset,
                        format!(
                            "frame subtype 0x{:02x} under {} format (expected 0x{:02x})",
                            subtype, format.encoding, expected
                        ),
                    ));
                }
                let frame = parse_frame(&entry, subtype == VS_FRAME_FRAME_BASED)?;
                format.frames.push(frame);
            }
            VS_STILL_IMAGE_FRAME | VS_COLORFORMAT => {}
            other => trace!("Skipping VS subtype 0x{:02x}", other),
        }
        Ok(())
    }

    fn finish(self, total: usize) -> Result<DeviceDescriptor, DescriptorError> {
        let control = self
            .control
            .ok_or_else(|| DescriptorError::new(total, "no video control interface"))?;
        if self.streaming.is_empty() {
            return Err(DescriptorError::new(total, "no video streaming interface"));
        }
        for iface in &self.streaming {
            if let Some(format) = iface.formats.iter().find(|f| f.frames.is_empty()) {
                return Err(DescriptorError::new(
                    total,
                    format!(
                        "format {} ({}) on interface {} has no frame descriptors",
                        format.index, format.encoding, iface.interface
                    ),
                ));
            }
        }
        debug!(
            "Parsed UVC {:x}.{:02x} catalog: {} streaming interface(s), {} format(s)",
            self.uvc_version >> 8,
            self.uvc_version & 0xFF,
            self.streaming.len(),
            self.streaming.iter().map(|s| s.formats.len()).sum::<usize>()
        );
        Ok(DeviceDescriptor {
            vendor_id: 0,
            product_id: 0,
            usb_version: 0,
            uvc_version: self.uvc_version,
            control,
            streaming: self.streaming,
        })
    }
}

fn push_format(
    iface: &mut StreamingInterface,
    entry: &Entry<'_>,
    encoding: Encoding,
    bits_per_pixel: u8,
    default_frame_index: u8,
) -> Result<(), DescriptorError> {
    if let Some(previous) = iface.formats.last() {
        if previous.frames.is_empty() {
            return Err(DescriptorError::new(
                entry.offset,
                format!("format {} has no frame descriptors", previous.index),
            ));
        }
    }
    iface.formats.push(FormatDescriptor {
        index: entry.u8(3),
        encoding,
        bits_per_pixel,
        default_frame_index,
        frames: Vec::new(),
    });
    Ok(())
}

fn parse_frame(entry: &Entry<'_>, frame_based: bool) -> Result<FrameDescriptor, DescriptorError> {
    // Frame-based frames drop dwMaxVideoFrameBufferSize and add
    // dwBytesPerLine after the interval type.
    let (max_frame_size, default_at, type_at, list_at) = if frame_based {
        entry.require(26, "frame-based frame descriptor")?;
        (0, 17, 21, 26)
    } else {
        entry.require(26, "frame descriptor")?;
        (entry.u32(17), 21, 25, 26)
    };

    let interval_type = entry.u8(type_at) as usize;
    let intervals = if interval_type == 0 {
        entry.require(list_at + 12, "continuous frame intervals")?;
        FrameIntervals::Continuous {
            min: entry.u32(list_at),
            max: entry.u32(list_at + 4),
            step: entry.u32(list_at + 8),
        }
    } else {
        entry.require(list_at + interval_type * 4, "discrete frame intervals")?;
        FrameIntervals::Discrete(
            (0..interval_type)
                .map(|i| entry.u32(list_at + i * 4))
                .collect(),
        )
    };

    Ok(FrameDescriptor {
        index: entry.u8(3),
        width: entry.u16(5),
        height: entry.u16(7),
        max_frame_size,
        default_interval: entry.u32(default_at),
        intervals,
    })
}

fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::builder::{ConfigurationBuilder, FormatSpec, FrameSpec};

    fn webcam() -> Vec<u8> {
        ConfigurationBuilder::webcam().build()
    }

    #[test]
    fn test_parse_webcam_catalog() {
        let catalog = parse_configuration(&webcam()).unwrap();
        assert_eq!(catalog.uvc_version, 0x0110);
        assert_eq!(catalog.control.interface, 0);
        assert_eq!(catalog.control.camera_terminal().unwrap().id, 1);
        assert_eq!(catalog.control.processing_units[0].source_id, 1);
        assert_eq!(catalog.control.extension_units.len(), 1);

        let stream = &catalog.streaming[0];
        assert_eq!(stream.interface, 1);
        assert_eq!(stream.endpoint_address, 0x81);
        assert_eq!(stream.terminal_link, 3);

        let yuy2 = stream.format(1).unwrap();
        assert_eq!(yuy2.encoding, Encoding::Yuy2);
        assert_eq!(yuy2.bits_per_pixel, 16);
        let mjpeg = stream.format(2).unwrap();
        assert_eq!(mjpeg.encoding, Encoding::Mjpeg);

        let svga = mjpeg.frame_by_size(800, 600).unwrap();
        assert!(svga.intervals.supports(333_333));
        assert_eq!(svga.default_interval, 333_333);

        // alt 0 has no endpoint, the rest are isochronous
        assert!(stream.alt_setting(0).unwrap().endpoint.is_none());
        let capacities: Vec<usize> = stream
            .isochronous_alts()
            .iter()
            .map(|a| a.payload_capacity())
            .collect();
        assert_eq!(capacities, vec![128, 512, 1024, 2048, 3072]);
    }

    #[test]
    fn test_parse_is_deterministic() {
        let bytes = webcam();
        assert_eq!(
            parse_configuration(&bytes).unwrap(),
            parse_configuration(&bytes).unwrap()
        );
    }

    #[test]
    fn test_length_exceeding_buffer_is_malformed() {
        let mut bytes = webcam();
        let last = bytes.len() - 1;
        bytes.truncate(last);
        let err = parse_configuration(&bytes).unwrap_err();
        assert!(err.reason.contains("exceeds remaining"), "{}", err);
    }

    #[test]
    fn test_zero_length_entry_is_malformed() {
        let mut bytes = webcam();
        bytes.extend_from_slice(&[0, 0x24]);
        assert!(parse_configuration(&bytes).is_err());
    }

    #[test]
    fn test_must_start_with_configuration() {
        let mut bytes = webcam();
        bytes[1] = DT_INTERFACE;
        let err = parse_configuration(&bytes).unwrap_err();
        assert_eq!(err.offset, 0);
    }

    #[test]
    fn test_format_without_frames_is_malformed() {
        let bytes = ConfigurationBuilder::new()
            .format(FormatSpec::new(Encoding::Yuy2, vec![]))
            .build();
        let err = parse_configuration(&bytes).unwrap_err();
        assert!(err.reason.contains("no frame descriptors"), "{}", err);
    }

    #[test]
    fn test_frame_subtype_must_match_format() {
        let mut bytes = ConfigurationBuilder::new()
            .format(FormatSpec::new(
                Encoding::Mjpeg,
                vec![FrameSpec::new(640, 480, vec![333_333])],
            ))
            .build();
        // Rewrite the MJPEG frame subtype as an uncompressed frame.
        let pos = bytes
            .windows(3)
            .position(|w| w[1] == DT_CS_INTERFACE && w[2] == VS_FRAME_MJPEG)
            .unwrap();
        bytes[pos + 2] = VS_FRAME_UNCOMPRESSED;
        assert!(parse_configuration(&bytes).is_err());
    }

    #[test]
    fn test_unknown_entries_are_skipped() {
        let plain = webcam();
        let mut noisy = plain.clone();
        // vendor-specific descriptor and an unknown VS subtype appended
        // inside the streaming interface
        noisy.extend_from_slice(&[5, 0x41, 1, 2, 3]);
        noisy.extend_from_slice(&[4, DT_CS_INTERFACE, 0x7E, 0]);
        assert_eq!(
            parse_configuration(&plain).unwrap(),
            parse_configuration(&noisy).unwrap()
        );
    }

    #[test]
    fn test_bulk_device_and_continuous_intervals() {
        let bytes = ConfigurationBuilder::new()
            .bulk(512)
            .format(FormatSpec::new(
                Encoding::Yuy2,
                vec![FrameSpec::continuous(320, 240, 333_333, 2_000_000, 333_333)],
            ))
            .build();
        let catalog = parse_configuration(&bytes).unwrap();
        let stream = &catalog.streaming[0];
        let ep = stream.bulk_endpoint().unwrap();
        assert_eq!(ep.kind, EndpointKind::Bulk);
        assert_eq!(ep.payload_capacity(), 512);
        assert!(stream.isochronous_alts().is_empty());
        assert_eq!(
            stream.formats[0].frames[0].intervals,
            FrameIntervals::Continuous {
                min: 333_333,
                max: 2_000_000,
                step: 333_333
            }
        );
    }

    #[test]
    fn test_parse_device_descriptor() {
        let device = ConfigurationBuilder::device_descriptor(0x046d, 0x085e);
        let ids = parse_device_descriptor(&device).unwrap();
        assert_eq!(ids.vendor_id, 0x046d);
        assert_eq!(ids.product_id, 0x085e);
        assert_eq!(ids.usb_version, 0x0200);

        assert!(parse_device_descriptor(&device[..10]).is_err());
    }
}
