//! Runtime settings of the detection loop.
//!
use std::{fmt, str::FromStr, time::Duration};

use thiserror::Error;

/// Period used when none is configured.
pub const DEFAULT_DETECTION_PERIOD_MS: u64 = 66;

/// Shortest accepted period, roughly one frame at 60 fps. Shorter positive values are raised.
pub const MIN_DETECTION_PERIOD_MS: u64 = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("detection frequency must be a whole number of milliseconds, got {0:?}")]
    NotANumber(String),
    #[error("detection frequency must be positive, got {0} ms")]
    NonPositive(i64),
}

/// Period between two detection ticks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DetectionFrequency(u64);

impl DetectionFrequency {
    pub fn from_millis(millis: i64) -> Result<Self, ConfigError> {
        if millis <= 0 {
            return Err(ConfigError::NonPositive(millis));
        }

        let millis = millis as u64;
        if millis < MIN_DETECTION_PERIOD_MS {
            log::warn!(
                "Detection frequency {} ms is below the minimum, using {} ms",
                millis,
                MIN_DETECTION_PERIOD_MS
            );
            return Ok(Self(MIN_DETECTION_PERIOD_MS));
        }

        Ok(Self(millis))
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn period(self) -> Duration {
        Duration::from_millis(self.0)
    }
}

impl Default for DetectionFrequency {
    fn default() -> Self {
        Self(DEFAULT_DETECTION_PERIOD_MS)
    }
}

impl FromStr for DetectionFrequency {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let millis: i64 = s
            .trim()
            .parse()
            .map_err(|_| ConfigError::NotANumber(s.to_owned()))?;
        Self::from_millis(millis)
    }
}

impl fmt::Display for DetectionFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a tick does while an earlier tick's detection is still running.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, clap::ValueEnum)]
pub enum InFlightPolicy {
    /// Run concurrently. Completions apply in arrival order, so a slow, older detection can
    /// overwrite the results of a newer one.
    #[default]
    Overlap,
    /// Drop the tick.
    SkipWhileBusy,
}
