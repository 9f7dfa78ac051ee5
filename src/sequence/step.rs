//! Calibration step definitions and validation.
//!
//! Step lists arrive from the (out-of-scope) configuration surface already
//! validated, but the sequencer re-validates defensively: a step that
//! scores a channel without a tolerance must be rejected before the run
//! starts, not discovered mid-run.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Closed set of step kinds, parsed case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    /// Pre-adjustment verification; persists a test point on the probe.
    AsFound,
    /// Post-adjustment verification.
    AsLeft,
    Final,
}

impl FromStr for StepKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "as-found" | "as found" | "asfound" => Ok(Self::AsFound),
            "as-left" | "as left" | "asleft" => Ok(Self::AsLeft),
            "final" => Ok(Self::Final),
            other => Err(ValidationError::UnknownStepKind(other.to_string())),
        }
    }
}

/// Signed tolerance band applied around the reference reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub min: f64,
    pub max: f64,
}

impl Tolerance {
    /// Symmetric band of ±`accuracy`.
    pub fn symmetric(accuracy: f64) -> Self {
        Self {
            min: -accuracy.abs(),
            max: accuracy.abs(),
        }
    }

    /// Bounds for a given reference reading: `[reference + min,
    /// reference + max]`, inclusive.
    pub fn bounds(&self, reference: f64) -> (f64, f64) {
        (reference + self.min, reference + self.max)
    }
}

/// One declared calibration step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStep {
    pub kind: StepKind,
    pub temperature_setpoint: f64,
    pub humidity_setpoint: f64,
    pub soak: Duration,
    pub evaluate_temperature: bool,
    pub evaluate_humidity: bool,
    pub temperature_tolerance: Option<Tolerance>,
    pub humidity_tolerance: Option<Tolerance>,
}

impl CalibrationStep {
    /// A scored channel must carry a tolerance. `index` is only for the
    /// error message.
    pub fn validate(&self, index: usize) -> Result<(), ValidationError> {
        if self.evaluate_temperature && self.temperature_tolerance.is_none() {
            return Err(ValidationError::MissingTolerance {
                step: index,
                channel: "temperature",
            });
        }
        if self.evaluate_humidity && self.humidity_tolerance.is_none() {
            return Err(ValidationError::MissingTolerance {
                step: index,
                channel: "humidity",
            });
        }
        Ok(())
    }
}

/// Parse a soak duration: either a duration literal ("10m", "90s",
/// "1h 30m") or a bare number of minutes ("45", "7.5").
pub fn parse_soak(text: &str, step_index: usize) -> Result<Duration, ValidationError> {
    let trimmed = text.trim();
    if let Ok(duration) = humantime::parse_duration(trimmed) {
        return Ok(duration);
    }
    if let Ok(minutes) = trimmed.parse::<f64>() {
        if minutes.is_finite() && minutes >= 0.0 {
            return Ok(Duration::from_secs_f64(minutes * 60.0));
        }
    }
    Err(ValidationError::BadSoakDuration {
        step: step_index,
        text: trimmed.to_string(),
    })
}
