//! Frame decoding: MJPEG through a [`JpegDecoder`], raw formats validated
//! and passed through or converted by a [`YuvConverter`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::frame::{CompletedFrame, DecodedFrame, Encoding, FrameLayout, PixelFormat};
use crate::error::DecodeError;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Pixels produced by a JPEG decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JpegImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// `Rgb24` or `Grey`
    pub format: PixelFormat,
}

pub trait JpegDecoder: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<JpegImage, DecodeError>;
}

pub trait YuvConverter: Send + Sync {
    /// Convert a validated raw frame to packed RGB24.
    fn to_rgb24(
        &self,
        data: &[u8],
        encoding: Encoding,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, DecodeError>;
}

/// Baseline decoder backed by `jpeg-decoder`. Handles the Huffman-table-less
/// MJPEG frames many webcams send.
#[derive(Debug, Default, Clone, Copy)]
pub struct BaselineJpeg;

impl JpegDecoder for BaselineJpeg {
    fn decode(&self, data: &[u8]) -> Result<JpegImage, DecodeError> {
        let mut decoder = jpeg_decoder::Decoder::new(data);
        let pixels = decoder
            .decode()
            .map_err(|e| DecodeError::Jpeg(e.to_string()))?;
        let info = decoder
            .info()
            .ok_or_else(|| DecodeError::Jpeg("missing frame header".into()))?;
        let format = match info.pixel_format {
            jpeg_decoder::PixelFormat::RGB24 => PixelFormat::Rgb24,
            jpeg_decoder::PixelFormat::L8 => PixelFormat::Grey,
            other => {
                return Err(DecodeError::Jpeg(format!(
                    "unsupported JPEG pixel format {:?}",
                    other
                )))
            }
        };
        Ok(JpegImage {
            pixels,
            width: info.width as u32,
            height: info.height as u32,
            format,
        })
    }
}

/// SIMD decoder backed by `zune-jpeg`.
#[cfg(feature = "fast-jpeg")]
#[derive(Debug, Default, Clone, Copy)]
pub struct ZuneJpeg;

#[cfg(feature = "fast-jpeg")]
impl JpegDecoder for ZuneJpeg {
    fn decode(&self, data: &[u8]) -> Result<JpegImage, DecodeError> {
        use zune_jpeg::zune_core::colorspace::ColorSpace;

        let mut decoder = zune_jpeg::JpegDecoder::new(data);
        let pixels = decoder
            .decode()
            .map_err(|e| DecodeError::Jpeg(format!("{:?}", e)))?;
        let (width, height) = decoder
            .dimensions()
            .ok_or_else(|| DecodeError::Jpeg("missing frame header".into()))?;
        let format = match decoder.get_output_colorspace() {
            Some(ColorSpace::RGB) => PixelFormat::Rgb24,
            Some(ColorSpace::Luma) => PixelFormat::Grey,
            other => {
                return Err(DecodeError::Jpeg(format!(
                    "unsupported output colorspace {:?}",
                    other
                )))
            }
        };
        Ok(JpegImage {
            pixels,
            width: width as u32,
            height: height as u32,
            format,
        })
    }
}

/// Integer BT.601 conversion.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareYuv;

#[inline]
fn yuv_to_rgb(y: i32, u: i32, v: i32, out: &mut [u8]) {
    out[0] = (y + ((v * 359) >> 8)).clamp(0, 255) as u8;
    out[1] = (y - ((u * 88 + v * 183) >> 8)).clamp(0, 255) as u8;
    out[2] = (y + ((u * 454) >> 8)).clamp(0, 255) as u8;
}

impl YuvConverter for SoftwareYuv {
    fn to_rgb24(
        &self,
        data: &[u8],
        encoding: Encoding,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, DecodeError> {
        let pixels = width as usize * height as usize;
        let mut rgb = vec![0u8; pixels * 3];

        match encoding {
            Encoding::Yuy2 | Encoding::Uyvy => {
                // byte offsets of Y0, U, Y1, V within a macropixel
                let (y0, u, y1, v) = if encoding == Encoding::Yuy2 {
                    (0, 1, 2, 3)
                } else {
                    (1, 0, 3, 2)
                };
                for (src, dst) in data.chunks_exact(4).zip(rgb.chunks_exact_mut(6)) {
                    let cu = src[u] as i32 - 128;
                    let cv = src[v] as i32 - 128;
                    yuv_to_rgb(src[y0] as i32, cu, cv, &mut dst[..3]);
                    yuv_to_rgb(src[y1] as i32, cu, cv, &mut dst[3..]);
                }
            }
            Encoding::Nv12 => {
                check_subsampled(encoding, width, height)?;
                if data.len() < pixels + pixels / 2 {
                    return Err(DecodeError::SizeMismatch {
                        expected: pixels + pixels / 2,
                        actual: data.len(),
                    });
                }
                let (luma, chroma) = data.split_at(pixels);
                let w = width as usize;
                for (i, dst) in rgb.chunks_exact_mut(3).enumerate() {
                    let (row, col) = (i / w, i % w);
                    let c = (row / 2) * w + (col & !1);
                    let cu = chroma[c] as i32 - 128;
                    let cv = chroma[c + 1] as i32 - 128;
                    yuv_to_rgb(luma[i] as i32, cu, cv, dst);
                }
            }
            Encoding::Grey => {
                for (src, dst) in data.iter().zip(rgb.chunks_exact_mut(3)) {
                    dst.fill(*src);
                }
            }
            other => return Err(DecodeError::Unsupported(other)),
        }
        Ok(rgb)
    }
}

/// 4:2:0 chroma planes need whole 2x2 blocks.
fn check_subsampled(encoding: Encoding, width: u32, height: u32) -> Result<(), DecodeError> {
    if width % 2 != 0 || height % 2 != 0 {
        return Err(DecodeError::OddDimensions {
            encoding,
            width,
            height,
        });
    }
    Ok(())
}

/// Injected decode capabilities.
#[derive(Clone)]
pub struct Codecs {
    pub jpeg: Arc<dyn JpegDecoder>,
    pub yuv: Arc<dyn YuvConverter>,
}

impl Default for Codecs {
    fn default() -> Self {
        #[cfg(feature = "fast-jpeg")]
        let jpeg: Arc<dyn JpegDecoder> = Arc::new(ZuneJpeg);
        #[cfg(not(feature = "fast-jpeg"))]
        let jpeg: Arc<dyn JpegDecoder> = Arc::new(BaselineJpeg);

        Self {
            jpeg,
            yuv: Arc::new(SoftwareYuv),
        }
    }
}

/// What raw formats are delivered as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Pass raw formats through untouched
    #[default]
    Native,
    /// Convert YUY2/UYVY/NV12/GREY to RGB24
    Rgb24,
}

pub struct FormatDecoder {
    layout: FrameLayout,
    output: OutputFormat,
    codecs: Codecs,
}

impl FormatDecoder {
    pub fn new(layout: FrameLayout, output: OutputFormat, codecs: Codecs) -> Self {
        Self {
            layout,
            output,
            codecs,
        }
    }

    pub fn decode(&self, frame: CompletedFrame) -> Result<DecodedFrame, DecodeError> {
        let encoding = frame.meta.encoding;
        let (data, width, height, format) = match encoding {
            Encoding::Mjpeg => self.decode_mjpeg(&frame)?,
            Encoding::FrameBased(_) => return Err(DecodeError::Unsupported(encoding)),
            _ => self.decode_raw(&frame)?,
        };

        let stride = match format {
            PixelFormat::Rgb24 => width * 3,
            PixelFormat::Yuyv | PixelFormat::Uyvy => width * 2,
            PixelFormat::Nv12 | PixelFormat::Grey => width,
            PixelFormat::Raw => width * self.layout.bits_per_pixel / 8,
        };

        Ok(DecodedFrame {
            data,
            width,
            height,
            stride,
            format,
            sequence: frame.meta.sequence,
            presentation_time: frame.meta.presentation_time,
            timestamp: frame.timestamp,
        })
    }

    fn decode_mjpeg(
        &self,
        frame: &CompletedFrame,
    ) -> Result<(bytes::Bytes, u32, u32, PixelFormat), DecodeError> {
        let data = &frame.data[..];
        if !data.starts_with(&SOI) {
            return Err(DecodeError::Truncated("missing SOI marker"));
        }
        // Devices pad MJPEG payloads past EOI
        let end = data
            .windows(2)
            .rposition(|w| w == EOI)
            .ok_or(DecodeError::Truncated("missing EOI marker"))?;
        let image = self.codecs.jpeg.decode(&data[..end + 2])?;

        let (width, height) = (frame.meta.width, frame.meta.height);
        if image.width != width || image.height != height {
            return Err(DecodeError::DimensionMismatch {
                width,
                height,
                actual_width: image.width,
                actual_height: image.height,
            });
        }

        if self.output == OutputFormat::Rgb24 && image.format == PixelFormat::Grey {
            let rgb = self
                .codecs
                .yuv
                .to_rgb24(&image.pixels, Encoding::Grey, width, height)?;
            return Ok((rgb.into(), width, height, PixelFormat::Rgb24));
        }
        Ok((image.pixels.into(), width, height, image.format))
    }

    fn decode_raw(
        &self,
        frame: &CompletedFrame,
    ) -> Result<(bytes::Bytes, u32, u32, PixelFormat), DecodeError> {
        let encoding = frame.meta.encoding;
        let (width, height) = (frame.meta.width, frame.meta.height);
        let layout = FrameLayout {
            encoding,
            width,
            height,
            ..self.layout
        };
        if encoding == Encoding::Nv12 {
            check_subsampled(encoding, width, height)?;
        }
        let expected = layout
            .expected_size()
            .ok_or(DecodeError::Unsupported(encoding))?;
        if frame.data.len() != expected {
            return Err(DecodeError::SizeMismatch {
                expected,
                actual: frame.data.len(),
            });
        }

        let native = encoding
            .native_pixel_format()
            .ok_or(DecodeError::Unsupported(encoding))?;
        let convertible = matches!(
            encoding,
            Encoding::Yuy2 | Encoding::Uyvy | Encoding::Nv12 | Encoding::Grey
        );
        if self.output == OutputFormat::Rgb24 && convertible {
            let rgb = self
                .codecs
                .yuv
                .to_rgb24(&frame.data, encoding, width, height)?;
            return Ok((rgb.into(), width, height, PixelFormat::Rgb24));
        }
        Ok((frame.data.clone(), width, height, native))
    }
}
