//! Groups UVC payloads into frames using the FID/EOF/ERR header bits.
//!
//! At most one frame is in progress. A toggle change or an EOF always ends
//! it; frames that did not end cleanly are dropped, never merged with the
//! next one.

use std::fmt;
use std::time::Instant;

use bytes::BytesMut;
use tracing::trace;

use super::frame::{CompletedFrame, FrameLayout, FrameMetadata};
use super::payload::{HeaderError, PayloadHeader};

/// Why a frame never reached the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The device flagged the payload with the error bit.
    PayloadError,
    /// The frame queue was full and the oldest frame was evicted.
    Backpressure,
    /// The frame grew past dwMaxVideoFrameSize.
    Overflow,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadError => write!(f, "payload error"),
            Self::Backpressure => write!(f, "backpressure"),
            Self::Overflow => write!(f, "overflow"),
        }
    }
}

/// Outcome of feeding one payload.
#[derive(Debug)]
pub enum Assembly {
    Frame(CompletedFrame),
    Dropped { reason: DropReason, bytes: usize },
    /// Toggle changed before EOF; the unfinished frame was dropped.
    Partial { bytes: usize },
    HeaderTooShort(HeaderError),
}

pub struct FrameReassembler {
    layout: FrameLayout,
    buffer: BytesMut,
    toggle: Option<bool>,
    /// Overflowed frame being skipped until its boundary.
    discarding: bool,
    sequence: u64,
    presentation_time: Option<u32>,
    started: Option<Instant>,
}

impl FrameReassembler {
    pub fn new(layout: FrameLayout) -> Self {
        let capacity = layout
            .expected_size()
            .or(layout.max_frame_size)
            .unwrap_or(0);
        Self {
            layout,
            buffer: BytesMut::with_capacity(capacity),
            toggle: None,
            discarding: false,
            sequence: 0,
            presentation_time: None,
            started: None,
        }
    }

    /// Feed one payload (header included).
    pub fn push(&mut self, payload: &[u8], mut emit: impl FnMut(Assembly)) {
        let header = match PayloadHeader::parse(payload) {
            Ok(header) => header,
            Err(e) => {
                emit(Assembly::HeaderTooShort(e));
                return;
            }
        };

        if header.error {
            let bytes = self.discard();
            self.toggle = None;
            emit(Assembly::Dropped {
                reason: DropReason::PayloadError,
                bytes,
            });
            return;
        }

        if self.toggle.is_some_and(|t| t != header.frame_id) {
            self.boundary(&mut emit);
        }
        self.toggle = Some(header.frame_id);

        let data = header.data(payload);
        if !data.is_empty() && !self.discarding {
            let max = self.layout.max_frame_size;
            if max.is_some_and(|max| self.buffer.len() + data.len() > max) {
                let bytes = self.discard() + data.len();
                self.discarding = true;
                emit(Assembly::Dropped {
                    reason: DropReason::Overflow,
                    bytes,
                });
            } else {
                if self.buffer.is_empty() {
                    self.started = Some(Instant::now());
                    self.presentation_time = header.pts;
                }
                self.buffer.extend_from_slice(data);
            }
        }

        if header.end_of_frame {
            if self.discarding {
                self.discarding = false;
            } else if !self.buffer.is_empty() {
                emit(Assembly::Frame(self.finish()));
            }
        }
    }

    /// Drop the frame in progress and forget the toggle. Returns the number
    /// of discarded bytes.
    pub fn reset(&mut self) -> usize {
        self.toggle = None;
        self.discarding = false;
        self.discard()
    }

    /// Bytes accumulated for the frame in progress.
    pub fn in_progress(&self) -> usize {
        self.buffer.len()
    }

    /// Sequence number of the last completed frame.
    pub fn last_sequence(&self) -> u64 {
        self.sequence
    }

    fn boundary(&mut self, emit: &mut impl FnMut(Assembly)) {
        self.discarding = false;
        if self.buffer.is_empty() {
            return;
        }
        // Some devices never set EOF on uncompressed streams
        if self.layout.expected_size() == Some(self.buffer.len()) {
            trace!("Frame completed on toggle change without EOF");
            emit(Assembly::Frame(self.finish()));
        } else {
            let bytes = self.discard();
            emit(Assembly::Partial { bytes });
        }
    }

    fn finish(&mut self) -> CompletedFrame {
        self.sequence += 1;
        let data = self.buffer.split().freeze();
        CompletedFrame {
            data,
            meta: FrameMetadata {
                sequence: self.sequence,
                width: self.layout.width,
                height: self.layout.height,
                encoding: self.layout.encoding,
                presentation_time: self.presentation_time.take(),
            },
            timestamp: self.started.take().unwrap_or_else(Instant::now),
        }
    }

    fn discard(&mut self) -> usize {
        let bytes = self.buffer.len();
        self.buffer.clear();
        self.presentation_time = None;
        self.started = None;
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::Encoding;
    use crate::capture::payload::{FLAG_EOF, FLAG_EOH, FLAG_ERR, FLAG_FID};

    fn mjpeg() -> FrameReassembler {
        FrameReassembler::new(FrameLayout {
            encoding: Encoding::Mjpeg,
            width: 640,
            height: 480,
            bits_per_pixel: 0,
            max_frame_size: None,
        })
    }

    fn payload(fid: bool, eof: bool, data: &[u8]) -> Vec<u8> {
        let mut flags = FLAG_EOH;
        if fid {
            flags |= FLAG_FID;
        }
        if eof {
            flags |= FLAG_EOF;
        }
        let mut out = vec![2, flags];
        out.extend_from_slice(data);
        out
    }

    fn feed(r: &mut FrameReassembler, payloads: &[Vec<u8>]) -> Vec<Assembly> {
        let mut out = Vec::new();
        for p in payloads {
            r.push(p, |a| out.push(a));
        }
        out
    }

    fn frames(out: &[Assembly]) -> Vec<(u64, Vec<u8>)> {
        out.iter()
            .filter_map(|a| match a {
                Assembly::Frame(f) => Some((f.meta.sequence, f.data.to_vec())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_clean_stream() {
        let mut r = mjpeg();
        let out = feed(
            &mut r,
            &[
                payload(false, false, b"AB"),
                payload(false, true, b"C"),
                payload(true, false, b"DE"),
                payload(true, true, b"F"),
            ],
        );
        assert_eq!(
            frames(&out),
            vec![(1, b"ABC".to_vec()), (2, b"DEF".to_vec())]
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_missing_eof_yields_partial() {
        let mut r = mjpeg();
        let out = feed(
            &mut r,
            &[
                payload(false, false, b"AB"),
                payload(true, false, b"CD"),
                payload(true, true, b"E"),
            ],
        );
        assert!(matches!(out[0], Assembly::Partial { bytes: 2 }));
        assert_eq!(frames(&out), vec![(1, b"CDE".to_vec())]);
    }

    #[test]
    fn test_error_bit_drops_frame() {
        let mut r = mjpeg();
        let mut bad = payload(false, false, b"X");
        bad[1] |= FLAG_ERR;
        let out = feed(
            &mut r,
            &[
                payload(false, false, b"AB"),
                bad,
                payload(false, false, b"CD"),
                payload(false, true, b"E"),
            ],
        );
        assert!(matches!(
            out[0],
            Assembly::Dropped {
                reason: DropReason::PayloadError,
                bytes: 2
            }
        ));
        // the toggle was forgotten, so the same FID starts cleanly
        assert_eq!(frames(&out), vec![(1, b"CDE".to_vec())]);
    }

    #[test]
    fn test_same_toggle_after_eof_starts_fresh_frame() {
        let mut r = mjpeg();
        let out = feed(
            &mut r,
            &[
                payload(false, true, b"AB"),
                payload(false, false, b"CD"),
                payload(false, true, b"E"),
            ],
        );
        assert_eq!(
            frames(&out),
            vec![(1, b"AB".to_vec()), (2, b"CDE".to_vec())]
        );
    }

    #[test]
    fn test_heartbeat_and_short_headers() {
        let mut r = mjpeg();
        let out = feed(
            &mut r,
            &[
                payload(false, false, b""),
                vec![1],
                payload(false, false, b"AB"),
                payload(false, false, b""),
                payload(false, true, b""),
            ],
        );
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Assembly::HeaderTooShort(_)));
        assert_eq!(frames(&out), vec![(1, b"AB".to_vec())]);
    }

    #[test]
    fn test_overflow_discards_until_boundary() {
        let mut r = FrameReassembler::new(FrameLayout {
            encoding: Encoding::Mjpeg,
            width: 2,
            height: 2,
            bits_per_pixel: 0,
            max_frame_size: Some(4),
        });
        let out = feed(
            &mut r,
            &[
                payload(false, false, b"ABC"),
                payload(false, false, b"DE"),
                payload(false, true, b"F"),
                payload(true, true, b"GH"),
            ],
        );
        assert!(matches!(
            out[0],
            Assembly::Dropped {
                reason: DropReason::Overflow,
                bytes: 5
            }
        ));
        assert_eq!(frames(&out), vec![(1, b"GH".to_vec())]);
    }

    #[test]
    fn test_uncompressed_frame_completes_on_toggle_without_eof() {
        let mut r = FrameReassembler::new(FrameLayout {
            encoding: Encoding::Yuy2,
            width: 2,
            height: 1,
            bits_per_pixel: 16,
            max_frame_size: None,
        });
        let out = feed(
            &mut r,
            &[
                payload(false, false, b"ABCD"),
                payload(true, false, b"EF"),
            ],
        );
        assert_eq!(frames(&out), vec![(1, b"ABCD".to_vec())]);
        assert_eq!(r.in_progress(), 2);
        assert_eq!(r.reset(), 2);
        assert_eq!(r.in_progress(), 0);
    }
}
