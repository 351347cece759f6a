//! Utility functions and helpers.

pub mod cancel;
pub mod log;

pub use cancel::Cancellation;

/// Format a duration as `1h 02m 03s`, dropping leading zero units.
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}
