use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
///
/// Every persisted timestamp in deskbridge uses this unit, which also matches
/// the backing protocol's `origin_server_ts`.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Convert a day count to milliseconds.
pub const fn days_ms(days: u64) -> u64 {
    days * 24 * 60 * 60 * 1000
}
