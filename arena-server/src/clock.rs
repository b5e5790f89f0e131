//! Time helpers. Status effects and heartbeats are tracked as absolute
//! millisecond deadlines so that checks reduce to a comparison against
//! `now_ms()` with no per-effect bookkeeping.

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Wall-clock seconds since the Unix epoch, truncated to the 32 bit
/// timestamp every packet header carries.
pub fn wire_timestamp() -> u32 {
    (now_ms() / 1000) as u32
}
