//! Outgoing command values and wire serialization.
//!
//! ## Probe protocol (outbound)
//!
//! One ASCII line per command, carriage-return terminated:
//!
//! `{<device_type:1><address:2><op>[ <arg>;<arg>;...]}\r`
//!
//! - `{F00RDD}` — read current values, broadcast/test address
//! - `{F05ERD 0;1295;004}` — read 4 bytes of register memory at bank 0,
//!   address 1295
//! - `{F05EWR 0;1295;064;160;000;000;}` — write 4 bytes, each a zero-padded
//!   3-digit decimal
//! - `{F05HCA 0;1;0;45.30;}` — save a humidity test point against the
//!   reference instrument (mode 0, temporary store 0)

use super::codec::encode_float_as_decimal_bytes;
use std::time::Duration;

/// Read current measured values.
pub const OP_READ_VALUES: &str = "RDD";
/// Periodic self-test query returning raw counts and corrections.
pub const OP_SELF_TEST: &str = "STS";
/// Read a 4-byte register.
pub const OP_REGISTER_READ: &str = "ERD";
/// Write a 4-byte register.
pub const OP_REGISTER_WRITE: &str = "EWR";
/// Persist a humidity calibration test point on the probe.
pub const OP_SAVE_TEST_POINT: &str = "HCA";

/// Broadcast/test address used for discovery.
pub const BROADCAST_ADDRESS: &str = "00";

/// Device-type character of the humidity/temperature probes.
pub const DEVICE_TYPE_PROBE: char = 'F';

/// Register bank holding the calibration constants.
pub const CONSTANT_BANK: u16 = 0;
/// Every constant register is a 4-byte IEEE-754 float.
pub const CONSTANT_LEN: u16 = 4;

/// Memory addresses of the five stored calibration constants.
pub mod registers {
    pub const PT100_A: u16 = 1295;
    pub const PT100_B: u16 = 1299;
    pub const PT100_C: u16 = 1303;
    pub const ADC_OFFSET: u16 = 1307;
    pub const ADC_FACTOR: u16 = 1311;
}

/// Normalize a raw address string to the two-character protocol form.
///
/// Protocol addresses are low-order bytes: empty input maps to the
/// broadcast address, numeric input is reduced modulo 100 and zero-padded,
/// and over-long text keeps only its last two characters.
pub fn normalize_address(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return BROADCAST_ADDRESS.to_string();
    }
    if let Ok(n) = trimmed.parse::<u64>() {
        return format!("{:02}", n % 100);
    }
    let chars: Vec<char> = trimmed.chars().collect();
    match chars.len() {
        1 => format!("0{}", chars[0]),
        2 => trimmed.to_string(),
        _ => chars[chars.len() - 2..].iter().collect(),
    }
}

/// An immutable outgoing command.
///
/// A `Command` has no identity beyond its content; serialization via
/// [`Command::to_wire`] is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub device_type: char,
    /// Two-character normalized protocol address.
    pub address: String,
    pub op: &'static str,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl Command {
    pub fn new(
        device_type: char,
        address: &str,
        op: &'static str,
        args: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            device_type,
            address: normalize_address(address),
            op,
            args,
            timeout,
        }
    }

    /// Read current values (`RDD`). With the broadcast address this doubles
    /// as the discovery probe.
    pub fn read_values(device_type: char, address: &str, timeout: Duration) -> Self {
        Self::new(device_type, address, OP_READ_VALUES, Vec::new(), timeout)
    }

    /// Periodic self-test query (`STS`).
    pub fn self_test(device_type: char, address: &str, timeout: Duration) -> Self {
        Self::new(device_type, address, OP_SELF_TEST, Vec::new(), timeout)
    }

    /// Read `len` bytes of register memory (`ERD`).
    pub fn register_read(
        device_type: char,
        address: &str,
        bank: u16,
        register: u16,
        len: u16,
        timeout: Duration,
    ) -> Self {
        Self::new(
            device_type,
            address,
            OP_REGISTER_READ,
            vec![bank.to_string(), register.to_string(), format!("{len:03}")],
            timeout,
        )
    }

    /// Write one float to a 4-byte register (`EWR`). The firmware expects a
    /// trailing semicolon after the last byte, produced here by an empty
    /// final argument.
    pub fn register_write(
        device_type: char,
        address: &str,
        bank: u16,
        register: u16,
        value: f64,
        timeout: Duration,
    ) -> Self {
        let mut args = vec![bank.to_string(), register.to_string()];
        args.extend(
            encode_float_as_decimal_bytes(value)
                .split(';')
                .map(str::to_string),
        );
        args.push(String::new());
        Self::new(device_type, address, OP_REGISTER_WRITE, args, timeout)
    }

    /// Persist a humidity test point (`HCA`) using the reference
    /// instrument's current reading. Mode 0 selects reference-instrument
    /// comparison, store 0 a temporary store.
    pub fn save_test_point(
        device_type: char,
        address: &str,
        reference_humidity: f64,
        timeout: Duration,
    ) -> Self {
        Self::new(
            device_type,
            address,
            OP_SAVE_TEST_POINT,
            vec![
                "0".to_string(),
                "1".to_string(),
                "0".to_string(),
                format!("{reference_humidity:.2}"),
                String::new(),
            ],
            timeout,
        )
    }

    /// Serialize to the CR-terminated wire form.
    pub fn to_wire(&self) -> String {
        if self.args.is_empty() {
            format!("{{{}{}{}}}\r", self.device_type, self.address, self.op)
        } else {
            format!(
                "{{{}{}{} {}}}\r",
                self.device_type,
                self.address,
                self.op,
                self.args.join(";")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(500);

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address(""), "00");
        assert_eq!(normalize_address("   "), "00");
        assert_eq!(normalize_address("7"), "07");
        assert_eq!(normalize_address("42"), "42");
        assert_eq!(normalize_address("123"), "23");
        assert_eq!(normalize_address("205"), "05");
        assert_eq!(normalize_address("a"), "0a");
        assert_eq!(normalize_address("ab"), "ab");
        assert_eq!(normalize_address("abc"), "bc");
    }

    #[test]
    fn test_discovery_wire_form() {
        let cmd = Command::read_values('F', "", T);
        assert_eq!(cmd.to_wire(), "{F00RDD}\r");
    }

    #[test]
    fn test_register_read_wire_form() {
        let cmd = Command::register_read('F', "5", 0, 1295, 4, T);
        assert_eq!(cmd.to_wire(), "{F05ERD 0;1295;004}\r");
    }

    #[test]
    fn test_register_write_wire_form() {
        // 5.0f32 is 0x40A00000 big-endian: 64, 160, 0, 0.
        let cmd = Command::register_write('F', "5", 0, 1295, 5.0, T);
        assert_eq!(cmd.to_wire(), "{F05EWR 0;1295;064;160;000;000;}\r");
    }

    #[test]
    fn test_save_test_point_wire_form() {
        let cmd = Command::save_test_point('F', "05", 45.3, T);
        assert_eq!(cmd.to_wire(), "{F05HCA 0;1;0;45.30;}\r");
    }
}
