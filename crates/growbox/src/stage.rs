//! Growth-stage table: maps days since planting to irrigation parameters.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// One row of the stage table. From `day_threshold` onward the plant gets
/// `water_duration` seconds of water every `water_interval` hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub day_threshold: i64,
    pub water_duration: f64,
    pub water_interval: f64,
}

/// Grow day count used for stage lookup. The planting day itself is day -1
/// and the day after is day 0, so a stage at threshold N starts N+1 calendar
/// days after planting.
pub fn grow_days(planting_date: NaiveDate, today: NaiveDate) -> i64 {
    (today - planting_date).num_days() - 1
}

/// Resolve `(water_duration, water_interval)` for `today`.
///
/// Walks the table from the highest threshold down and takes the first stage
/// already reached. Anything before the first reachable stage, including a
/// planting date in the future, gets the germination stage.
pub fn resolve(planting_date: NaiveDate, today: NaiveDate, stages: &[Stage]) -> (f64, f64) {
    let days = grow_days(planting_date, today);

    let found = stages
        .iter()
        .rev()
        .find(|s| s.day_threshold <= days)
        .or_else(|| stages.iter().find(|s| s.day_threshold == 0))
        .or_else(|| stages.first());

    match found {
        Some(s) => (s.water_duration, s.water_interval),
        // Validation guarantees a germination stage; an empty slice is a
        // caller bug, answer with something harmless.
        None => (0.0, f64::MAX),
    }
}

/// Current irrigation parameters for a config: stage-derived once a planting
/// date exists, otherwise the authored grow values.
pub fn water_plan(config: &Config, today: NaiveDate) -> (f64, f64) {
    match config.grow.planting_date {
        Some(planted) => resolve(planted, today, &config.stages()),
        None => (config.grow.water_duration, config.grow.water_interval),
    }
}
