//! Wall-clock reading used for timestamps, epochs, and phase alignment.

use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the UNIX epoch.
///
/// Saturates to zero if the system clock reads before the epoch, which keeps
/// timestamp arithmetic total without poisoning the caller with an error it
/// could not act on anyway.
pub fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Milliseconds since the UNIX epoch.
pub fn unix_millis() -> u64 {
    unix_micros() / 1_000
}
