//! Unit conversions shared by negotiation and logging.

/// 100 ns units per second
const INTERVAL_UNITS_PER_SEC: f64 = 10_000_000.0;

/// Frame interval (100 ns units) for a frame rate.
pub fn fps_to_interval(fps: f64) -> u32 {
    if fps <= 0.0 {
        return 0;
    }
    (INTERVAL_UNITS_PER_SEC / fps).round() as u32
}

/// Frame rate for a frame interval (100 ns units). 0 for a zero interval.
pub fn interval_to_fps(interval: u32) -> f64 {
    if interval == 0 {
        return 0.0;
    }
    INTERVAL_UNITS_PER_SEC / interval as f64
}

/// "1.10" for 0x0110
pub fn bcd_to_string(bcd: u16) -> String {
    format!("{:x}.{:02x}", bcd >> 8, bcd & 0xff)
}
