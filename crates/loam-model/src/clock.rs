//! Wall-clock helpers shared by event logging and telemetry capture.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as nanoseconds since the Unix epoch.
pub fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Current wall-clock time as whole seconds since the Unix epoch.
pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Nanoseconds in one day, used for retention windows.
pub const NANOS_PER_DAY: u64 = 86_400_000_000_000;
