//! Test-case description loaded once at startup.
//!
//! The file is the JSON used by the flight test tool, with kebab-case keys and
//! optional whole-line `//` comments:
//!
//! ```json
//! {
//!     // seconds
//!     "period": 0.1,
//!     "period-offset": 0.05,
//!     "total-distance": 10000,
//!     "altitude-controls": [
//!         { "enter": 5.0, "exit": 15.0, "events": [
//!             { "type": "freq", "value": 400 },
//!             { "type": "altitude", "value": 11000, "count": 3 } ] }
//!     ],
//!     "manual": { "manual-enter": 20.0, "manual-exit": 30.0,
//!                 "leds": [ { "start-time": 21.0, "button": 2 } ] }
//! }
//! ```

use crate::protocol::{AltitudePeriod, LED_MAX, LED_MIN};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::Path;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_SPEED_STEP: u16 = 10;
pub const DEFAULT_LED_TIMEOUT_S: f64 = 3.0;
/// Upper bound for every time in a test case, in seconds (one day).
pub const MAX_TEST_TIME_S: f64 = 86_400.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read test case {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid test case JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid test case: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestCase {
    /// Period length in seconds.
    pub period: f64,
    /// Half-width of the window around each period time, in seconds.
    pub period_offset: f64,
    pub total_distance: u16,
    #[serde(default = "default_speed_step")]
    pub speed_step: u16,
    #[serde(default = "default_led_timeout")]
    pub led_timeout: f64,
    #[serde(default)]
    pub altitude_controls: Vec<AltitudeControlConfig>,
    #[serde(default)]
    pub manual: Option<ManualConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AltitudeControlConfig {
    pub enter: f64,
    pub exit: f64,
    #[serde(default)]
    pub events: Vec<AltitudeEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AltitudeEvent {
    /// Ask the plane to report altitude every `value` milliseconds.
    Freq { value: u16 },
    /// Accept any altitude for `count` periods.
    Free { count: u32 },
    /// Expect `value` on the next `count` due reports.
    Altitude { value: u16, count: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManualConfig {
    pub manual_enter: f64,
    pub manual_exit: f64,
    #[serde(default)]
    pub leds: Vec<LedTaskConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LedTaskConfig {
    pub start_time: f64,
    #[serde(alias = "button")]
    pub led: u8,
}

fn default_speed_step() -> u16 {
    DEFAULT_SPEED_STEP
}

fn default_led_timeout() -> f64 {
    DEFAULT_LED_TIMEOUT_S
}

impl TestCase {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading test case from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let stripped = strip_comment_lines(content);
        let test_case: TestCase = serde_json::from_str(&stripped)?;
        test_case.validate()?;
        Ok(test_case)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.period > 0.0 && self.period <= MAX_TEST_TIME_S) {
            return invalid(format!(
                "period must be in (0, {}], got {}",
                MAX_TEST_TIME_S, self.period
            ));
        }
        if !(self.period_offset > 0.0 && self.period_offset <= self.period) {
            return invalid(format!(
                "period-offset must be in (0, {}], got {}",
                self.period, self.period_offset
            ));
        }
        if self.speed_step == 0 {
            return invalid("speed-step must be non-zero".to_owned());
        }
        if !(self.led_timeout > 0.0 && self.led_timeout <= MAX_TEST_TIME_S) {
            return invalid(format!(
                "led-timeout must be in (0, {}], got {}",
                MAX_TEST_TIME_S, self.led_timeout
            ));
        }

        for (idx, control) in self.altitude_controls.iter().enumerate() {
            check_time("altitude control enter", control.enter)?;
            check_time("altitude control exit", control.exit)?;
            if control.enter.partial_cmp(&control.exit) != Some(Ordering::Less) {
                return invalid(format!(
                    "altitude control {} enters at {} but exits at {}",
                    idx, control.enter, control.exit
                ));
            }
            let mut reporting = false;
            for event in &control.events {
                match *event {
                    AltitudeEvent::Freq { value } => match AltitudePeriod::from_millis(value) {
                        Some(period) => reporting = period != AltitudePeriod::Off,
                        None => {
                            return invalid(format!(
                                "altitude control {} uses unsupported frequency {} ms",
                                idx, value
                            ));
                        }
                    },
                    AltitudeEvent::Free { count: 0 } | AltitudeEvent::Altitude { count: 0, .. } => {
                        return invalid(format!("altitude control {} has an event with count 0", idx));
                    }
                    AltitudeEvent::Altitude { value, .. } if !reporting => {
                        return invalid(format!(
                            "altitude control {} expects altitude {} before any report frequency",
                            idx, value
                        ));
                    }
                    _ => {}
                }
            }
        }

        if let Some(manual) = &self.manual {
            check_time("manual-enter", manual.manual_enter)?;
            check_time("manual-exit", manual.manual_exit)?;
            if manual.manual_enter.partial_cmp(&manual.manual_exit) != Some(Ordering::Less) {
                return invalid(format!(
                    "manual mode enters at {} but exits at {}",
                    manual.manual_enter, manual.manual_exit
                ));
            }
            for task in &manual.leds {
                check_time("start-time", task.start_time)?;
                if !(LED_MIN..=LED_MAX).contains(&task.led) {
                    return invalid(format!("led number {} is invalid", task.led));
                }
            }
        }
        Ok(())
    }

    /// Dispatcher timeout: slightly above one period.
    pub fn queue_timeout(&self) -> std::time::Duration {
        std::time::Duration::try_from_secs_f64(self.period * 1.1).unwrap_or(std::time::Duration::MAX)
    }
}

/// Times are seconds after the go command.
fn check_time(what: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=MAX_TEST_TIME_S).contains(&value) {
        Ok(())
    } else {
        invalid(format!("{} must be in [0, {}], got {}", what, MAX_TEST_TIME_S, value))
    }
}

fn invalid(message: String) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(message))
}

/// Drops every line that contains `//`.
fn strip_comment_lines(content: &str) -> String {
    content
        .lines()
        .filter(|line| !line.contains("//"))
        .collect::<Vec<_>>()
        .join("\n")
}
