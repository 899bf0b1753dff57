//! Wall-clock helpers shared by the cycles.

use chrono::{Local, Timelike};
use std::time::Duration;

/// Smallest delay any cycle reschedules itself with, in minutes. Banded
/// adjustments can push a computed delay to zero or below.
pub const MIN_DELAY_MINUTES: f64 = 0.1;

/// Longest delay any cycle waits, in minutes. Validated timings stay well
/// below this; it only bounds the conversion.
pub const MAX_DELAY_MINUTES: f64 = 2.0 * 24.0 * 60.0;

/// Convert a delay in minutes to a timer duration, clamped to
/// [`MIN_DELAY_MINUTES`]..=[`MAX_DELAY_MINUTES`]. NaN lands on the floor.
pub fn minutes_delay(minutes: f64) -> Duration {
    let minutes = if minutes >= MIN_DELAY_MINUTES {
        minutes.min(MAX_DELAY_MINUTES)
    } else {
        MIN_DELAY_MINUTES
    };
    Duration::try_from_secs_f64(minutes * 60.0)
        .unwrap_or(Duration::from_secs((MAX_DELAY_MINUTES * 60.0) as u64))
}

/// Local hour of day, 0-23.
pub fn current_hour() -> u32 {
    Local::now().hour()
}
