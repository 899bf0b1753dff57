//! TOML config file loading and validation for the control loop settings,
//! the grow stage table and the relay wiring.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::relay::Channel;
use crate::stage::Stage;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub control: ControlSection,
    pub grow: GrowSection,
    pub hardware: HardwareSection,
}

/// Timing knobs for the ventilation, heat and metrics cycles.
/// Air and heat values are minutes, `light_duration` is hours from midnight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSection {
    pub target_temperature: f64,
    pub air_interval: f64,
    pub air_duration: f64,
    pub heat_interval: f64,
    pub heat_duration: f64,
    pub light_duration: f64,
    pub metric_interval_secs: u64,
    pub config_check_interval_secs: u64,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            target_temperature: 76.0,
            air_interval: 1.0,
            air_duration: 1.0,
            heat_interval: 1.5,
            heat_duration: 1.5,
            light_duration: 18.0,
            metric_interval_secs: 30,
            config_check_interval_secs: 30,
        }
    }
}

/// Grow cycle: planting date plus the irrigation stage table.
///
/// `water_duration` (seconds) and `water_interval` (hours) are only used
/// directly while no planting date is set, and as the germination stage
/// when `stages` is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrowSection {
    pub planting_date: Option<NaiveDate>,
    pub water_duration: f64,
    pub water_interval: f64,
    pub stages: Vec<Stage>,
}

impl Default for GrowSection {
    fn default() -> Self {
        Self {
            planting_date: None,
            water_duration: 4.0,
            water_interval: 12.0,
            stages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareSection {
    pub lights_gpio: i64,
    pub water_gpio: i64,
    pub air_gpio: i64,
    pub heat_gpio: i64,
    pub active_low: bool,
    pub temperature_file: String,
}

impl Default for HardwareSection {
    fn default() -> Self {
        Self {
            lights_gpio: 17,
            water_gpio: 27,
            air_gpio: 22,
            heat_gpio: 23,
            active_low: true,
            temperature_file: "/sys/bus/w1/devices/28-0416b3494bff/temperature".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

// ---------------------------------------------------------------------------
// Timing bounds
// ---------------------------------------------------------------------------

/// Longest air/heat ON duration or OFF interval, in minutes (one day).
pub const MAX_CYCLE_MINUTES: f64 = 24.0 * 60.0;
/// Longest single watering, in seconds.
pub const MAX_WATER_SECS: f64 = 3600.0;
/// Longest gap between waterings, in hours (thirty days).
pub const MAX_WATER_INTERVAL_HOURS: f64 = 30.0 * 24.0;

/// Push an error unless `0 < value <= max`. NaN and infinities fail too.
fn check_timing(errors: &mut Vec<String>, ctx: &str, name: &str, value: f64, max: f64) {
    if !(value > 0.0) {
        errors.push(format!("{ctx}: {name} must be positive, got {value}"));
    } else if !(value <= max) {
        errors.push(format!("{ctx}: {name} {value} exceeds the maximum of {max}"));
    }
}

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Derived views
// ---------------------------------------------------------------------------

impl Config {
    /// The stage table the irrigation cycle resolves against. An empty table
    /// collapses to a single germination stage built from the grow defaults.
    pub fn stages(&self) -> Vec<Stage> {
        if self.grow.stages.is_empty() {
            vec![Stage {
                day_threshold: 0,
                water_duration: self.grow.water_duration,
                water_interval: self.grow.water_interval,
            }]
        } else {
            self.grow.stages.clone()
        }
    }

    /// Relay wiring as (channel, BCM pin). Only meaningful after `validate`.
    pub fn relay_pins(&self) -> Vec<(Channel, u8)> {
        let hw = &self.hardware;
        vec![
            (Channel::Lights, hw.lights_gpio as u8),
            (Channel::Water, hw.water_gpio as u8),
            (Channel::Air, hw.air_gpio as u8),
            (Channel::Heat, hw.heat_gpio as u8),
        ]
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_control(&mut errors);
        self.validate_grow(&mut errors);
        self.validate_hardware(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_control(&self, errors: &mut Vec<String>) {
        let c = &self.control;

        if !c.target_temperature.is_finite() {
            errors.push(format!(
                "control: target_temperature must be a finite number, got {}",
                c.target_temperature
            ));
        }

        for (name, value) in [
            ("air_interval", c.air_interval),
            ("air_duration", c.air_duration),
            ("heat_interval", c.heat_interval),
            ("heat_duration", c.heat_duration),
        ] {
            check_timing(errors, "control", name, value, MAX_CYCLE_MINUTES);
        }

        if !(c.light_duration > 0.0 && c.light_duration <= 24.0) {
            errors.push(format!(
                "control: light_duration {} out of range (0, 24]",
                c.light_duration
            ));
        }

        if c.metric_interval_secs == 0 {
            errors.push("control: metric_interval_secs must be positive, got 0".to_string());
        }
        if c.config_check_interval_secs == 0 {
            errors.push("control: config_check_interval_secs must be positive, got 0".to_string());
        }
    }

    fn validate_grow(&self, errors: &mut Vec<String>) {
        let g = &self.grow;

        check_timing(errors, "grow", "water_duration", g.water_duration, MAX_WATER_SECS);
        check_timing(
            errors,
            "grow",
            "water_interval",
            g.water_interval,
            MAX_WATER_INTERVAL_HOURS,
        );

        if g.stages.is_empty() {
            return;
        }

        if !g.stages.iter().any(|s| s.day_threshold == 0) {
            errors.push("grow: stages must include a germination stage with day_threshold 0".to_string());
        }

        let mut prev: Option<i64> = None;
        for (i, s) in g.stages.iter().enumerate() {
            let ctx = format!("stages[{i}] (day {})", s.day_threshold);

            if s.day_threshold < 0 {
                errors.push(format!("{ctx}: day_threshold must not be negative"));
            }
            if let Some(p) = prev {
                if s.day_threshold <= p {
                    errors.push(format!(
                        "{ctx}: day_threshold must be greater than the previous stage ({p})"
                    ));
                }
            }
            prev = Some(s.day_threshold);

            check_timing(errors, &ctx, "water_duration", s.water_duration, MAX_WATER_SECS);
            check_timing(
                errors,
                &ctx,
                "water_interval",
                s.water_interval,
                MAX_WATER_INTERVAL_HOURS,
            );
        }
    }

    fn validate_hardware(&self, errors: &mut Vec<String>) {
        let hw = &self.hardware;
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (channel, pin) in [
            (Channel::Lights, hw.lights_gpio),
            (Channel::Water, hw.water_gpio),
            (Channel::Air, hw.air_gpio),
            (Channel::Heat, hw.heat_gpio),
        ] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "hardware: {channel}_gpio {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen_pins.insert(pin) {
                errors.push(format!(
                    "hardware: {channel}_gpio {pin} is already used by another relay"
                ));
            }
        }

        if hw.temperature_file.trim().is_empty() {
            errors.push("hardware: temperature_file is empty".to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Like [`load`], but never fails: the control loop has to come up even when
/// the configuration source is unavailable, so fall back to built-in defaults.
pub fn load_or_default(path: &str) -> Config {
    match load(path) {
        Ok(config) => {
            tracing::info!(
                path,
                stages = config.grow.stages.len(),
                planting_date = ?config.grow.planting_date,
                "config loaded"
            );
            config
        }
        Err(e) => {
            tracing::warn!(path, "config unavailable, starting with defaults: {e:#}");
            Config::default()
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(day: i64, secs: f64, hours: f64) -> Stage {
        Stage {
            day_threshold: day,
            water_duration: secs,
            water_interval: hours,
        }
    }

    fn valid_config() -> Config {
        let mut cfg = Config::default();
        cfg.grow.planting_date = NaiveDate::from_ymd_opt(2025, 6, 1);
        cfg.grow.stages = vec![stage(0, 4.0, 12.0), stage(14, 6.0, 8.0), stage(30, 8.0, 6.0)];
        cfg
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[control]
target_temperature = 75.0
air_interval = 2.0
air_duration = 1.5
heat_interval = 1.4
heat_duration = 1.8
light_duration = 18
metric_interval_secs = 60

[grow]
planting_date = "2025-06-01"

[[grow.stages]]
day_threshold = 0
water_duration = 4.0
water_interval = 12.0

[[grow.stages]]
day_threshold = 21
water_duration = 8.0
water_interval = 6.0

[hardware]
lights_gpio = 5
water_gpio = 6
air_gpio = 13
heat_gpio = 19
active_low = false
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.control.target_temperature, 75.0);
        assert_eq!(config.control.light_duration, 18.0);
        assert_eq!(config.control.config_check_interval_secs, 30);
        assert_eq!(config.grow.planting_date, NaiveDate::from_ymd_opt(2025, 6, 1));
        assert_eq!(config.grow.stages.len(), 2);
        assert_eq!(config.grow.stages[1].day_threshold, 21);
        assert!(!config.hardware.active_low);
        assert_eq!(config.relay_pins()[2], (Channel::Air, 13));
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        config.validate().unwrap();
    }

    #[test]
    fn empty_stage_table_becomes_germination_stage() {
        let cfg = Config::default();
        assert_eq!(cfg.stages(), vec![stage(0, 4.0, 12.0)]);
    }

    // -- Validation: valid configs pass -----------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    // -- Control timings --------------------------------------------------

    #[test]
    fn air_interval_zero_rejected() {
        let mut cfg = valid_config();
        cfg.control.air_interval = 0.0;
        assert_validation_err(&cfg, "air_interval must be positive");
    }

    #[test]
    fn heat_duration_negative_rejected() {
        let mut cfg = valid_config();
        cfg.control.heat_duration = -1.0;
        assert_validation_err(&cfg, "heat_duration must be positive");
    }

    #[test]
    fn nan_timing_rejected() {
        let mut cfg = valid_config();
        cfg.control.air_duration = f64::NAN;
        assert_validation_err(&cfg, "air_duration must be positive");
    }

    #[test]
    fn light_duration_zero_rejected() {
        let mut cfg = valid_config();
        cfg.control.light_duration = 0.0;
        assert_validation_err(&cfg, "light_duration 0 out of range");
    }

    #[test]
    fn light_duration_above_24_rejected() {
        let mut cfg = valid_config();
        cfg.control.light_duration = 24.5;
        assert_validation_err(&cfg, "light_duration 24.5 out of range");
    }

    #[test]
    fn light_duration_24_accepted() {
        let mut cfg = valid_config();
        cfg.control.light_duration = 24.0;
        cfg.validate().unwrap();
    }

    #[test]
    fn target_temperature_infinite_rejected() {
        let mut cfg = valid_config();
        cfg.control.target_temperature = f64::INFINITY;
        assert_validation_err(&cfg, "target_temperature must be a finite number");
    }

    #[test]
    fn metric_interval_zero_rejected() {
        let mut cfg = valid_config();
        cfg.control.metric_interval_secs = 0;
        assert_validation_err(&cfg, "metric_interval_secs must be positive");
    }

    // -- Stage table ------------------------------------------------------

    #[test]
    fn stages_without_germination_rejected() {
        let mut cfg = valid_config();
        cfg.grow.stages.remove(0);
        assert_validation_err(&cfg, "germination stage with day_threshold 0");
    }

    #[test]
    fn stages_out_of_order_rejected() {
        let mut cfg = valid_config();
        cfg.grow.stages.swap(1, 2);
        assert_validation_err(&cfg, "must be greater than the previous stage (30)");
    }

    #[test]
    fn stages_duplicate_threshold_rejected() {
        let mut cfg = valid_config();
        cfg.grow.stages[2].day_threshold = 14;
        assert_validation_err(&cfg, "must be greater than the previous stage (14)");
    }

    #[test]
    fn stage_water_duration_zero_rejected() {
        let mut cfg = valid_config();
        cfg.grow.stages[1].water_duration = 0.0;
        assert_validation_err(&cfg, "stages[1] (day 14): water_duration must be positive");
    }

    // -- Hardware ---------------------------------------------------------

    #[test]
    fn gpio_pin_1_rejected() {
        let mut cfg = valid_config();
        cfg.hardware.heat_gpio = 1;
        assert_validation_err(&cfg, "heat_gpio 1 is not a valid BCM GPIO pin");
    }

    #[test]
    fn gpio_pin_28_rejected() {
        let mut cfg = valid_config();
        cfg.hardware.lights_gpio = 28;
        assert_validation_err(&cfg, "lights_gpio 28 is not a valid BCM GPIO pin");
    }

    #[test]
    fn duplicate_gpio_rejected() {
        let mut cfg = valid_config();
        cfg.hardware.air_gpio = cfg.hardware.water_gpio;
        assert_validation_err(&cfg, "air_gpio 27 is already used by another relay");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.control.air_interval = 0.0;
        cfg.control.light_duration = 30.0;
        cfg.hardware.water_gpio = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "wrong count in: {msg}");
        assert!(msg.contains("air_interval"), "missing air error in: {msg}");
        assert!(msg.contains("light_duration"), "missing light error in: {msg}");
        assert!(msg.contains("water_gpio"), "missing gpio error in: {msg}");
    }

    #[test]
    fn infinite_timings_rejected() {
        let mut cfg = valid_config();
        cfg.control.heat_duration = f64::INFINITY;
        assert_validation_err(&cfg, "heat_duration inf exceeds the maximum");

        let mut cfg = valid_config();
        cfg.control.air_interval = f64::NAN;
        assert_validation_err(&cfg, "air_interval must be positive, got NaN");
    }

    #[test]
    fn huge_finite_timings_rejected() {
        let mut cfg = valid_config();
        cfg.control.heat_duration = 1e300;
        assert_validation_err(&cfg, "control: heat_duration 1000");
        assert_validation_err(&cfg, "exceeds the maximum of 1440");

        let mut cfg = valid_config();
        cfg.grow.water_interval = 1e300;
        assert_validation_err(&cfg, "grow: water_interval 1000");
        assert_validation_err(&cfg, "exceeds the maximum of 720");
    }

    #[test]
    fn timing_bounds_are_inclusive() {
        let mut cfg = valid_config();
        cfg.control.air_duration = MAX_CYCLE_MINUTES;
        cfg.grow.water_duration = MAX_WATER_SECS;
        cfg.grow.water_interval = MAX_WATER_INTERVAL_HOURS;
        cfg.validate().unwrap();
    }

    #[test]
    fn toml_stage_with_infinite_water_rejected() {
        let toml_str = r#"
[[grow.stages]]
day_threshold = 0
water_duration = inf
water_interval = 12.0
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_validation_err(&cfg, "stages[0] (day 0): water_duration inf exceeds the maximum");
    }

    // -- Load -------------------------------------------------------------

    #[test]
    fn load_or_default_falls_back_when_missing() {
        let cfg = load_or_default("/nonexistent/growbox-config.toml");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn load_rejects_invalid_file() {
        let path = std::env::temp_dir().join(format!("growbox-invalid-{}.toml", std::process::id()));
        std::fs::write(&path, "[control]\nlight_duration = 0\n").unwrap();
        let err = load(path.to_str().unwrap()).unwrap_err();
        assert!(format!("{err:#}").contains("invalid config"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn example_config_is_valid() {
        let cfg: Config = toml::from_str(include_str!("../config.example.toml")).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.stages().len(), 3);
        assert_eq!(cfg.grow.planting_date, NaiveDate::from_ymd_opt(2026, 9, 1));
    }
}
