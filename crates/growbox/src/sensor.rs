//! 1-wire temperature sensor read through the kernel overlay file.
//!
//! The overlay reports millidegrees Celsius as plain text; the control loop
//! works in Fahrenheit.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::state::SharedState;

/// Convert a millidegree-Celsius reading to Fahrenheit, two decimals.
pub fn millicelsius_to_fahrenheit(milli_c: f64) -> f64 {
    let f = (milli_c / 1000.0) * 9.0 / 5.0 + 32.0;
    (f * 100.0).round() / 100.0
}

/// Parse the overlay file contents. The plain `temperature` attribute holds
/// a single integer; the legacy `w1_slave` format ends with `t=<milli>`.
pub fn parse_reading(contents: &str) -> Result<f64> {
    let raw = contents
        .rsplit("t=")
        .next()
        .unwrap_or(contents)
        .trim();
    let milli: f64 = raw
        .parse()
        .with_context(|| format!("unparseable temperature reading {raw:?}"))?;
    anyhow::ensure!(milli.is_finite(), "non-finite temperature reading {raw:?}");
    Ok(millicelsius_to_fahrenheit(milli))
}

pub struct TemperatureSource {
    path: PathBuf,
}

impl TemperatureSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_file(&self) -> Result<f64> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        parse_reading(&contents)
    }

    /// Read the sensor and publish the value as `curr_temperature`.
    ///
    /// On failure the previous temperature is kept and `None` is returned;
    /// the next metrics tick will simply try again.
    pub async fn read(&self, shared: &SharedState) -> Option<f64> {
        match self.read_file().await {
            Ok(temp) => {
                shared.write().await.curr_temperature = temp;
                debug!(temperature = temp, "temperature read");
                Some(temp)
            }
            Err(e) => {
                warn!("temperature read failed, keeping last value: {e:#}");
                shared
                    .write()
                    .await
                    .record_error(format!("temperature read failed: {e}"));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::ConfigState;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("growbox-{name}-{}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn converts_millicelsius() {
        assert_eq!(millicelsius_to_fahrenheit(25000.0), 77.0);
        assert_eq!(millicelsius_to_fahrenheit(0.0), 32.0);
        assert_eq!(millicelsius_to_fahrenheit(23437.0), 74.19);
    }

    #[test]
    fn parses_plain_and_w1_slave_formats() {
        assert_eq!(parse_reading("25000\n").unwrap(), 77.0);
        let w1 = "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n72 01 4b 46 7f ff 0e 10 57 t=23125\n";
        assert_eq!(parse_reading(w1).unwrap(), 73.63);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_reading("").is_err());
        assert!(parse_reading("not a number").is_err());
    }

    #[tokio::test]
    async fn read_updates_shared_temperature() {
        let path = temp_file("temp-ok", "24000");
        let shared = ConfigState::new(Config::default(), (4.0, 12.0)).shared();

        let source = TemperatureSource::new(&path);
        assert_eq!(source.read(&shared).await, Some(75.2));
        assert_eq!(shared.read().await.curr_temperature, 75.2);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn failed_read_keeps_last_value() {
        let shared = ConfigState::new(Config::default(), (4.0, 12.0)).shared();
        shared.write().await.curr_temperature = 71.5;

        let source = TemperatureSource::new("/nonexistent/w1/temperature");
        assert_eq!(source.read(&shared).await, None);

        let st = shared.read().await;
        assert_eq!(st.curr_temperature, 71.5);
        assert!(st.events.back().unwrap().detail.contains("temperature read failed"));
    }
}
