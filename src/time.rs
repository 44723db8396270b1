//! Wall-clock helper for stamping node `mtime` fields.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current time as seconds since the Unix epoch, truncated to
/// `u32` (the on-disk `mtime` field's width).
pub fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}
