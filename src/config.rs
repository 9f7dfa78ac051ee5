//! Layered application settings.
//!
//! Settings are built from three sources, later ones overriding earlier:
//! code defaults, an optional TOML file, and environment variables prefixed
//! with `HYGROCAL_` (e.g. `HYGROCAL_POLLING__PERIOD_SECS=30`).

use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serial line parameters and exchange timing.
///
/// The probe protocol is fixed at 19200 baud, 8 data bits, no parity,
/// 1 stop bit, no flow control; the baud rate is configurable only so the
/// bench can talk to adapters that re-clock the line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    pub baud_rate: u32,
    /// Granularity of the response polling loop.
    pub read_slice_ms: u64,
    /// Timeout for the broadcast discovery exchange.
    pub discovery_timeout_ms: u64,
    /// Timeout for routine value/poll exchanges.
    pub poll_timeout_ms: u64,
    /// Timeout for register read/write exchanges.
    pub register_timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 19200,
            read_slice_ms: 20,
            discovery_timeout_ms: 2000,
            poll_timeout_ms: 1500,
            register_timeout_ms: 2000,
        }
    }
}

impl SerialSettings {
    pub fn read_slice(&self) -> Duration {
        Duration::from_millis(self.read_slice_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }
}

/// Background poll loop cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    pub period_secs: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self { period_secs: 15 }
    }
}

impl PollingSettings {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

/// Calibration sampling cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingSettings {
    /// Samples collected per step.
    pub samples_per_step: u32,
    /// Delay between consecutive samples, milliseconds.
    pub sample_spacing_ms: u64,
    /// Soak countdown tick, milliseconds.
    pub soak_tick_ms: u64,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            samples_per_step: 5,
            sample_spacing_ms: 15_000,
            soak_tick_ms: 1_000,
        }
    }
}

impl SamplingSettings {
    pub fn sample_spacing(&self) -> Duration {
        Duration::from_millis(self.sample_spacing_ms)
    }

    pub fn soak_tick(&self) -> Duration {
        Duration::from_millis(self.soak_tick_ms)
    }
}

/// Coefficient solver parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverSettings {
    /// Lower bound of the valid calibration span, degrees Celsius.
    pub min_temperature_c: f64,
    /// Upper bound of the valid calibration span, degrees Celsius.
    pub max_temperature_c: f64,
    /// Pivot magnitude below which the normal equations are singular.
    pub pivot_epsilon: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            min_temperature_c: 0.0,
            max_temperature_c: 50.0,
            pivot_epsilon: 1e-9,
        }
    }
}

/// Top-level application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub serial: SerialSettings,
    pub polling: PollingSettings,
    pub sampling: SamplingSettings,
    pub solver: SolverSettings,
}

impl Settings {
    /// Load settings from defaults, an optional TOML file, and environment
    /// variables prefixed `HYGROCAL_` (double underscore separates nesting).
    pub fn new(config_path: Option<&str>) -> AppResult<Self> {
        let defaults = toml::to_string(&Settings::default()).map_err(|e| {
            config::ConfigError::Message(format!("failed to serialize defaults: {e}"))
        })?;

        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(&defaults, config::FileFormat::Toml));

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("HYGROCAL").separator("__"))
            .build()?
            .try_deserialize()?;

        Ok(settings)
    }
}
