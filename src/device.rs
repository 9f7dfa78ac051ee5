//! Data model: probes, the reference instrument, and their snapshots.
//!
//! All types here are plain data. Decoded frames ([`ProbeSnapshot`],
//! [`PollUpdate`]) are produced by the codec; the registry folds them into
//! the live [`Probe`] table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alarm codes are the literal string `"000"` when clear; anything else is
/// an active alarm.
pub fn alarm_active(code: &str) -> bool {
    code.trim() != "000"
}

/// One measured channel as reported in an identity/values frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelReading {
    pub value: f64,
    pub unit: String,
    pub alarm: bool,
    pub trend: char,
}

/// Decoded discovery/values response for one probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSnapshot {
    pub device_type: char,
    /// Two-character protocol address.
    pub address: String,
    /// Numeric probe-type code from the response header, when present.
    pub probe_code: Option<String>,
    pub humidity: ChannelReading,
    pub temperature: ChannelReading,
    /// Calculated parameter (dew point or similar) name.
    pub calc_name: String,
    pub calc: ChannelReading,
    pub model: String,
    pub firmware: String,
    pub serial_number: String,
    pub device_name: String,
    /// Device alarm byte, decoded as active/inactive.
    pub device_alarm: bool,
}

/// Decoded self-test poll response: raw counts and correction chain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollUpdate {
    pub humidity_count: f64,
    /// Four humidity-correction stages, in application order.
    pub humidity_correction: [f64; 4],
    pub corrected_humidity: f64,
    pub temperature_count: f64,
    pub resistance: f64,
    pub corrected_temperature: f64,
}

/// Calibration constants stored in probe register memory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalConstants {
    pub pt100_a: f64,
    pub pt100_b: f64,
    pub pt100_c: f64,
    pub adc_offset: f64,
    /// ADC count to resistance conversion factor.
    pub conversion_factor: f64,
}

/// A probe known to the registry.
///
/// Created on a successful discovery response and thereafter replaced
/// wholesale on each refresh, keyed by port name. Removed only at shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    /// Serial port this probe answered on; the registry key.
    pub port: String,
    pub snapshot: ProbeSnapshot,
    /// Raw counts from the most recent poll cycle, if any.
    pub raw: Option<PollUpdate>,
    /// Constants read back once after discovery.
    pub constants: Option<CalConstants>,
    pub last_seen: DateTime<Utc>,
}

impl Probe {
    pub fn from_snapshot(port: &str, snapshot: ProbeSnapshot) -> Self {
        Self {
            port: port.to_string(),
            snapshot,
            raw: None,
            constants: None,
            last_seen: Utc::now(),
        }
    }

    /// Probe temperature normalized to Celsius. Fahrenheit probes are
    /// detected by an `F` anywhere in the reported unit string.
    pub fn temperature_celsius(&self) -> f64 {
        normalize_to_celsius(
            self.snapshot.temperature.value,
            &self.snapshot.temperature.unit,
        )
    }
}

/// Convert a temperature to Celsius based on the reported unit string.
pub fn normalize_to_celsius(value: f64, unit: &str) -> f64 {
    if unit.to_ascii_uppercase().contains('F') {
        (value - 32.0) * 5.0 / 9.0
    } else {
        value
    }
}

/// Snapshot of the chilled-mirror reference instrument.
///
/// The acquisition path is external; the core only reads these values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mirror {
    pub id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub dew_point: f64,
    pub stable: bool,
}
