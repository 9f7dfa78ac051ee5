//! Pure decode/encode of device frames. No I/O.
//!
//! The probe firmware stores floats as four raw IEEE-754 bytes, reported
//! and written over the wire as zero-padded 3-digit decimals joined by
//! semicolons, most-significant byte first. Replies echo assorted framing
//! characters and pad fields inconsistently, so every decode path here is
//! tolerant by construction and returns a typed [`DecodeError`] instead of
//! panicking on garbage.

use crate::device::{alarm_active, ChannelReading, PollUpdate, ProbeSnapshot};
use crate::error::DecodeError;

/// Encode a float as the device's 4-byte register format: narrow to f32,
/// take the raw big-endian bytes, format each as a 3-digit decimal, join
/// with `;`. NaN and infinity encode faithfully from their bit patterns.
pub fn encode_float_as_decimal_bytes(value: f64) -> String {
    let bytes = (value as f32).to_be_bytes();
    let groups: Vec<String> = bytes.iter().map(|b| format!("{b:03}")).collect();
    groups.join(";")
}

/// Decode a register payload back to a float.
///
/// Strips framing characters, splits on `;`, and looks for the first run of
/// four consecutive fields whose leading 1-3 digit token is a byte value.
/// If no such window exists, falls back to scanning the whole payload for
/// any four byte-valued digit runs in document order.
pub fn decode_float_from_decimal_bytes(payload: &str) -> Result<f64, DecodeError> {
    let inner = clean_frame(payload);
    let tokens: Vec<Option<u8>> = inner.split(';').map(field_byte_token).collect();

    if tokens.len() >= 4 {
        for window in tokens.windows(4) {
            if let [Some(b0), Some(b1), Some(b2), Some(b3)] = window {
                return Ok(f32::from_be_bytes([*b0, *b1, *b2, *b3]) as f64);
            }
        }
    }

    // No clean 4-field window; take any four byte-valued runs in order.
    let bytes: Vec<u8> = digit_runs(&inner)
        .filter_map(|run| run.parse::<u32>().ok())
        .filter(|v| *v <= 255)
        .map(|v| v as u8)
        .take(4)
        .collect();

    match bytes.as_slice() {
        [b0, b1, b2, b3] => Ok(f32::from_be_bytes([*b0, *b1, *b2, *b3]) as f64),
        _ => Err(DecodeError::InsufficientFields(payload.trim().to_string())),
    }
}

/// Decode the discovery/values response into a [`ProbeSnapshot`].
///
/// Field order after the header: humidity (value, unit, alarm, trend),
/// temperature (value, unit, alarm, trend), calculated parameter (name,
/// value, unit, alarm, trend), model, firmware, serial number, device
/// name, alarm byte. At least ten fields must follow the header; the tail
/// is optional and defaults to empty.
pub fn decode_probe_identity_frame(raw: &str) -> Result<ProbeSnapshot, DecodeError> {
    let inner = clean_frame(raw);
    let mut fields: Vec<&str> = inner.split(';').map(str::trim).collect();
    strip_checksum(&mut fields);

    if fields.len() < 11 {
        return Err(DecodeError::MalformedFrame(format!(
            "identity frame has {} fields after the header, need at least 10",
            fields.len().saturating_sub(1)
        )));
    }

    let (device_type, address, probe_code) = parse_header(fields[0])?;
    let f = &fields[1..];

    Ok(ProbeSnapshot {
        device_type,
        address,
        probe_code,
        humidity: channel_at(f, 0, "humidity")?,
        temperature: channel_at(f, 4, "temperature")?,
        calc_name: text_at(f, 8),
        calc: ChannelReading {
            value: f.get(9).and_then(|v| v.parse().ok()).unwrap_or(f64::NAN),
            unit: text_at(f, 10),
            alarm: alarm_active(f.get(11).copied().unwrap_or("000")),
            trend: trend_at(f, 12),
        },
        model: text_at(f, 13),
        firmware: text_at(f, 14),
        serial_number: text_at(f, 15),
        device_name: text_at(f, 16),
        device_alarm: alarm_active(f.get(17).copied().unwrap_or("000")),
    })
}

/// Decode the periodic self-test response into a [`PollUpdate`].
///
/// The humidity raw count is the digit run at the end of the leading field
/// (the longest trailing run, so the embedded address is never mistaken for
/// the count); the remaining fields are the four humidity-correction
/// stages, corrected humidity, temperature raw count, resistance, and
/// corrected temperature.
pub fn decode_poll_frame(raw: &str) -> Result<PollUpdate, DecodeError> {
    let inner = clean_frame(raw);
    let mut fields: Vec<&str> = inner.split(';').map(str::trim).collect();
    strip_checksum(&mut fields);

    if fields.len() < 9 {
        return Err(DecodeError::MalformedFrame(format!(
            "poll frame has {} fields, need at least 9",
            fields.len()
        )));
    }

    let humidity_count = trailing_count(fields[0]).ok_or_else(|| {
        DecodeError::MalformedFrame(format!("no humidity count in leading field {:?}", fields[0]))
    })?;

    let num = |idx: usize, name: &'static str| -> Result<f64, DecodeError> {
        fields[idx]
            .parse::<f64>()
            .map_err(|_| DecodeError::BadNumericField {
                index: idx,
                name,
                value: fields[idx].to_string(),
            })
    };

    Ok(PollUpdate {
        humidity_count,
        humidity_correction: [
            num(1, "humidity correction 1")?,
            num(2, "humidity correction 2")?,
            num(3, "humidity correction 3")?,
            num(4, "humidity correction 4")?,
        ],
        corrected_humidity: num(5, "corrected humidity")?,
        temperature_count: num(6, "temperature count")?,
        resistance: num(7, "resistance")?,
        corrected_temperature: num(8, "corrected temperature")?,
    })
}

/// Split a response header token into device type, address, and the
/// optional numeric probe-type code.
///
/// `"F05rdd 001"` yields `('F', "05", Some("001"))`: one device-type
/// character, two address characters, any command echo ignored, and the
/// first all-digit token after the address taken as the probe code.
pub fn parse_header(token: &str) -> Result<(char, String, Option<String>), DecodeError> {
    let token = token.trim();
    let mut parts = token.split_whitespace();
    let lead = parts
        .next()
        .ok_or_else(|| DecodeError::MalformedFrame("empty header token".to_string()))?;

    let mut chars = lead.chars();
    let device_type = chars
        .next()
        .ok_or_else(|| DecodeError::MalformedFrame("empty header token".to_string()))?;
    let address: String = chars.by_ref().take(2).collect();
    if address.len() < 2 {
        return Err(DecodeError::MalformedFrame(format!(
            "header token {token:?} too short for an address"
        )));
    }

    // Probe code: digit run at the tail of the lead token, or the first
    // all-digit token that follows.
    let tail: String = chars.collect();
    let probe_code = trailing_digits(&tail)
        .map(str::to_string)
        .or_else(|| {
            parts
                .find(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
                .map(str::to_string)
        });

    Ok((device_type, address, probe_code))
}

/// Remove framing characters the device echoes around payloads.
fn clean_frame(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '{' | '}' | '\r' | '\n'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Drop a trailing single-character checksum field, if present.
fn strip_checksum(fields: &mut Vec<&str>) {
    if fields.len() > 1 && fields.last().map(|f| f.chars().count()) == Some(1) {
        fields.pop();
    }
}

/// Leading 1-3 digit token of a field interpreted as a byte, tolerating
/// stray non-digit characters before and after.
fn field_byte_token(field: &str) -> Option<u8> {
    let run = digit_runs(field).next()?;
    if run.len() > 3 {
        return None;
    }
    run.parse::<u32>().ok().filter(|v| *v <= 255).map(|v| v as u8)
}

/// Iterator over maximal contiguous digit runs in a string.
fn digit_runs(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| !c.is_ascii_digit())
        .filter(|run| !run.is_empty())
}

/// Digit run at the very end of a string, if any.
fn trailing_digits(s: &str) -> Option<&str> {
    let end = s.len();
    let start = s
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    Some(&s[start..end])
}

/// Signed count at the tail of the poll frame's leading field.
fn trailing_count(field: &str) -> Option<f64> {
    let trimmed = field.trim_end_matches(|c: char| !c.is_ascii_digit());
    let digits = trailing_digits(trimmed)?;
    let start = trimmed.len() - digits.len();
    let negative = start > 0 && trimmed.as_bytes()[start - 1] == b'-';
    let value: f64 = digits.parse().ok()?;
    Some(if negative { -value } else { value })
}

fn channel_at(
    fields: &[&str],
    base: usize,
    name: &'static str,
) -> Result<ChannelReading, DecodeError> {
    let raw = fields.get(base).copied().unwrap_or("");
    let value = raw.parse::<f64>().map_err(|_| DecodeError::BadNumericField {
        index: base,
        name,
        value: raw.to_string(),
    })?;
    Ok(ChannelReading {
        value,
        unit: text_at(fields, base + 1),
        alarm: alarm_active(fields.get(base + 2).copied().unwrap_or("000")),
        trend: trend_at(fields, base + 3),
    })
}

fn text_at(fields: &[&str], idx: usize) -> String {
    fields.get(idx).copied().unwrap_or("").to_string()
}

fn trend_at(fields: &[&str], idx: usize) -> char {
    fields
        .get(idx)
        .and_then(|f| f.chars().next())
        .unwrap_or('=')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_five() {
        // 5.0f32 = 0x40A00000.
        assert_eq!(encode_float_as_decimal_bytes(5.0), "064;160;000;000");
    }

    #[test]
    fn test_encode_decode_round_trip() {
        for value in [0.0f32, 5.0, -3.25, 0.00385, 100.0, 1e-6, f32::MAX] {
            let encoded = encode_float_as_decimal_bytes(value as f64);
            let decoded = decode_float_from_decimal_bytes(&encoded).unwrap();
            assert_eq!(decoded, value as f64, "round trip of {value}");
        }
    }

    #[test]
    fn test_nan_encodes_from_bit_pattern() {
        let encoded = encode_float_as_decimal_bytes(f64::NAN);
        let decoded = decode_float_from_decimal_bytes(&encoded).unwrap();
        assert!(decoded.is_nan());
    }

    #[test]
    fn test_decode_tolerates_framing_and_padding() {
        // Inconsistent padding, echoed braces and CRLF.
        let decoded = decode_float_from_decimal_bytes("{64;160;0;0}\r\n").unwrap();
        assert_eq!(decoded, 5.0);
    }

    #[test]
    fn test_decode_skips_echo_prefix_fields() {
        // Command echo fields before the byte window.
        let decoded = decode_float_from_decimal_bytes("F05ERD;ok;064;160;000;000").unwrap();
        assert_eq!(decoded, 5.0);
    }

    #[test]
    fn test_decode_fallback_whole_payload_scan() {
        // No 4-field window, but four byte tokens exist in document order.
        let decoded = decode_float_from_decimal_bytes("x064 y160;z0 w0").unwrap();
        assert_eq!(decoded, 5.0);
    }

    #[test]
    fn test_decode_insufficient_fields() {
        let err = decode_float_from_decimal_bytes("{064;160;000}").unwrap_err();
        assert!(matches!(err, DecodeError::InsufficientFields(_)));
    }

    #[test]
    fn test_parse_header() {
        let (dt, addr, code) = parse_header("F05rdd 001").unwrap();
        assert_eq!(dt, 'F');
        assert_eq!(addr, "05");
        assert_eq!(code.as_deref(), Some("001"));
    }

    #[test]
    fn test_parse_header_embedded_code() {
        let (dt, addr, code) = parse_header("F00rdd001").unwrap();
        assert_eq!(dt, 'F');
        assert_eq!(addr, "00");
        assert_eq!(code.as_deref(), Some("001"));
    }

    #[test]
    fn test_parse_header_too_short() {
        assert!(parse_header("F").is_err());
        assert!(parse_header("").is_err());
    }

    fn identity_frame() -> String {
        "{F05rdd 001};23.45;%rh;000;=;24.10;°C;000;+;Dp;12.30;°C;000;=;HC2-S;V1.9;0012345678;bench-3;000;A}".to_string()
    }

    #[test]
    fn test_decode_identity_frame() {
        let snap = decode_probe_identity_frame(&identity_frame()).unwrap();
        assert_eq!(snap.device_type, 'F');
        assert_eq!(snap.address, "05");
        assert_eq!(snap.probe_code.as_deref(), Some("001"));
        assert_eq!(snap.humidity.value, 23.45);
        assert_eq!(snap.humidity.unit, "%rh");
        assert!(!snap.humidity.alarm);
        assert_eq!(snap.humidity.trend, '=');
        assert_eq!(snap.temperature.value, 24.10);
        assert_eq!(snap.temperature.unit, "°C");
        assert_eq!(snap.temperature.trend, '+');
        assert_eq!(snap.calc_name, "Dp");
        assert_eq!(snap.calc.value, 12.30);
        assert_eq!(snap.model, "HC2-S");
        assert_eq!(snap.firmware, "V1.9");
        assert_eq!(snap.serial_number, "0012345678");
        assert_eq!(snap.device_name, "bench-3");
        assert!(!snap.device_alarm);
    }

    #[test]
    fn test_decode_identity_frame_alarm_codes() {
        let raw = identity_frame().replace(";23.45;%rh;000;", ";23.45;%rh;004;");
        let snap = decode_probe_identity_frame(&raw).unwrap();
        assert!(snap.humidity.alarm);
    }

    #[test]
    fn test_decode_identity_frame_too_few_fields() {
        // Nine payload fields after the checksum is stripped.
        let raw = "{F05rdd 001};1;2;3;4;5;6;7;8;9;A}";
        let err = decode_probe_identity_frame(raw).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedFrame(_)));
    }

    #[test]
    fn test_decode_identity_minimal_ten_fields() {
        // Exactly ten payload fields; everything past them defaults.
        let raw = "{F02rdd 001};45.1;%rh;000;=;21.0;°C;000;=;Dp;10.5;Z}";
        let snap = decode_probe_identity_frame(raw).unwrap();
        assert_eq!(snap.humidity.value, 45.1);
        assert_eq!(snap.calc.value, 10.5);
        assert_eq!(snap.serial_number, "");
        assert_eq!(snap.device_name, "");
    }

    #[test]
    fn test_decode_poll_frame() {
        let raw = "{F05STS 01234};0.10;0.20;0.30;0.40;45.60;5678;108.42;21.55;B}";
        let update = decode_poll_frame(raw).unwrap();
        assert_eq!(update.humidity_count, 1234.0);
        assert_eq!(update.humidity_correction, [0.10, 0.20, 0.30, 0.40]);
        assert_eq!(update.corrected_humidity, 45.60);
        assert_eq!(update.temperature_count, 5678.0);
        assert_eq!(update.resistance, 108.42);
        assert_eq!(update.corrected_temperature, 21.55);
    }

    #[test]
    fn test_poll_frame_count_is_trailing_run() {
        // The address digits must not be mistaken for the count.
        let update =
            decode_poll_frame("F05STS00999;0;0;0;0;45.0;100;100.0;20.0").unwrap();
        assert_eq!(update.humidity_count, 999.0);
    }

    #[test]
    fn test_poll_frame_negative_count() {
        let update = decode_poll_frame("F05STS -0042;0;0;0;0;45.0;100;100.0;20.0").unwrap();
        assert_eq!(update.humidity_count, -42.0);
    }

    #[test]
    fn test_poll_frame_too_short() {
        let err = decode_poll_frame("F05STS 0123;1;2;3").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedFrame(_)));
    }
}
