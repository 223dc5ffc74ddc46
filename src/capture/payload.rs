//! UVC payload header (UVC 1.5 §2.4.3.3).

use thiserror::Error;

pub const MIN_HEADER_LEN: usize = 2;

pub const FLAG_FID: u8 = 0x01;
pub const FLAG_EOF: u8 = 0x02;
pub const FLAG_PTS: u8 = 0x04;
pub const FLAG_SCR: u8 = 0x08;
pub const FLAG_STI: u8 = 0x20;
pub const FLAG_ERR: u8 = 0x40;
pub const FLAG_EOH: u8 = 0x80;

const PTS_LEN: usize = 4;
const SCR_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("payload header too short: {available} bytes available, {required} required")]
pub struct HeaderError {
    pub available: usize,
    pub required: usize,
}

/// Source clock reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scr {
    pub source_time_clock: u32,
    /// 11-bit USB SOF counter
    pub sof_counter: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PayloadHeader {
    /// bHeaderLength
    pub length: usize,
    pub frame_id: bool,
    pub end_of_frame: bool,
    pub still_image: bool,
    pub error: bool,
    pub end_of_header: bool,
    pub pts: Option<u32>,
    pub scr: Option<Scr>,
}

impl PayloadHeader {
    pub fn parse(payload: &[u8]) -> Result<Self, HeaderError> {
        if payload.len() < MIN_HEADER_LEN {
            return Err(HeaderError {
                available: payload.len(),
                required: MIN_HEADER_LEN,
            });
        }

        let length = payload[0] as usize;
        let flags = payload[1];

        let mut required = MIN_HEADER_LEN;
        if flags & FLAG_PTS != 0 {
            required += PTS_LEN;
        }
        if flags & FLAG_SCR != 0 {
            required += SCR_LEN;
        }
        if length < required {
            return Err(HeaderError {
                available: length,
                required,
            });
        }
        if payload.len() < length {
            return Err(HeaderError {
                available: payload.len(),
                required: length,
            });
        }

        let mut at = MIN_HEADER_LEN;
        let pts = if flags & FLAG_PTS != 0 {
            let v = u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]]);
            at += PTS_LEN;
            Some(v)
        } else {
            None
        };
        let scr = if flags & FLAG_SCR != 0 {
            let stc = u32::from_le_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]]);
            let sof = u16::from_le_bytes([payload[at + 4], payload[at + 5]]) & 0x07FF;
            Some(Scr {
                source_time_clock: stc,
                sof_counter: sof,
            })
        } else {
            None
        };

        Ok(Self {
            length,
            frame_id: flags & FLAG_FID != 0,
            end_of_frame: flags & FLAG_EOF != 0,
            still_image: flags & FLAG_STI != 0,
            error: flags & FLAG_ERR != 0,
            end_of_header: flags & FLAG_EOH != 0,
            pts,
            scr,
        })
    }

    /// Video data following the header.
    pub fn data<'a>(&self, payload: &'a [u8]) -> &'a [u8] {
        &payload[self.length.min(payload.len())..]
    }

    /// Serialize into the on-wire layout; `length` is recomputed.
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = FLAG_EOH;
        if self.frame_id {
            flags |= FLAG_FID;
        }
        if self.end_of_frame {
            flags |= FLAG_EOF;
        }
        if self.still_image {
            flags |= FLAG_STI;
        }
        if self.error {
            flags |= FLAG_ERR;
        }
        if self.pts.is_some() {
            flags |= FLAG_PTS;
        }
        if self.scr.is_some() {
            flags |= FLAG_SCR;
        }

        let mut out = vec![0, flags];
        if let Some(pts) = self.pts {
            out.extend_from_slice(&pts.to_le_bytes());
        }
        if let Some(scr) = self.scr {
            out.extend_from_slice(&scr.source_time_clock.to_le_bytes());
            out.extend_from_slice(&(scr.sof_counter & 0x07FF).to_le_bytes());
        }
        out[0] = out.len() as u8;
        out
    }
}
