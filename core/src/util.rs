use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Current wall-clock time in microseconds since the epoch. Used only for
/// display-side receipt timestamps, never for ordering.
pub(crate) fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
