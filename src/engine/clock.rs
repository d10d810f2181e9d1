//! Engine clock: milliseconds since the UNIX epoch.
//!
//! Muxer deadlines, interpolator anchors, and frame timestamps all use
//! this one scale so cross-component arithmetic stays trivial.

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
