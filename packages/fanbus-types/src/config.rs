//! Fan-array processor configuration record.
//!
//! Arrives as the second handshake payload segment: a whitespace-or-comma
//! delimited record, e.g.
//!
//! ```text
//! 1 4 5000 1 2 11500 1185 0.1 0.05 5 ABCD [\]^
//! ```
//!
//! mode, active fans, PWM frequency, tach pulse count, pulses per rotation,
//! max RPM, min RPM, chase tolerance, min duty cycle, max stall timeouts,
//! then one PWM-pin and one tach-pin character per active fan (pin number =
//! ASCII code − '0', so `A` is pin 17). Validation is all-or-nothing: a
//! single bad field rejects the whole record and the previous configuration
//! stays active.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::MAX_FANS;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("expected {expected} config fields, got {got}")]
    FieldCount { expected: usize, got: usize },
    #[error("invalid integer for {field}: `{value}`")]
    BadInt { field: &'static str, value: String },
    #[error("invalid number for {field}: `{value}`")]
    BadFloat { field: &'static str, value: String },
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
    #[error("{field} must name {expected} pins, got {got}")]
    PinCount {
        field: &'static str,
        expected: usize,
        got: usize,
    },
}

/// Whether each PWM channel drives one or two fans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanMode {
    Single,
    Double,
}

impl FanMode {
    pub fn code(&self) -> u8 {
        match self {
            FanMode::Single => 1,
            FanMode::Double => 2,
        }
    }

    fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(FanMode::Single),
            2 => Some(FanMode::Double),
            _ => None,
        }
    }
}

/// Validated fan-array configuration, replaced atomically on each
/// successful handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub mode: FanMode,
    pub active_fans: usize,
    pub pwm_freq_hz: u32,
    pub tach_pulse_count: u32,
    pub pulses_per_rev: u32,
    pub max_rpm: u32,
    pub min_rpm: u32,
    /// Chase tolerance as a fraction of `max_rpm`.
    pub tolerance: f64,
    /// Lowest duty cycle the fans reliably spin at.
    pub min_duty: f64,
    /// Consecutive stalled/unstable ticks before a chase is aborted.
    pub max_fan_timeouts: u32,
    pub pwm_pins: Vec<u8>,
    pub tach_pins: Vec<u8>,
}

const FIELDS: usize = 12;

impl ProcessorConfig {
    /// Parse and range-validate a handshake config record. All-or-nothing:
    /// the first invalid field rejects the record.
    pub fn parse(payload: &str) -> Result<Self, ConfigError> {
        let tokens: Vec<&str> = payload
            .split(|c: char| c == ' ' || c == ',' || c == '\t')
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.len() != FIELDS {
            return Err(ConfigError::FieldCount {
                expected: FIELDS,
                got: tokens.len(),
            });
        }

        let mode_code = int(tokens[0], "mode")?;
        let mode = FanMode::from_code(mode_code).ok_or(ConfigError::OutOfRange {
            field: "mode",
            value: tokens[0].to_string(),
        })?;
        let active_fans = int(tokens[1], "active_fans")? as usize;
        if active_fans == 0 || active_fans > MAX_FANS {
            return Err(ConfigError::OutOfRange {
                field: "active_fans",
                value: tokens[1].to_string(),
            });
        }
        let pwm_freq_hz = positive_u32(tokens[2], "pwm_freq_hz")?;
        let tach_pulse_count = positive_u32(tokens[3], "tach_pulse_count")?;
        let pulses_per_rev = positive_u32(tokens[4], "pulses_per_rev")?;
        let max_rpm = positive_u32(tokens[5], "max_rpm")?;
        let min_rpm = positive_u32(tokens[6], "min_rpm")?;
        if min_rpm >= max_rpm {
            return Err(ConfigError::OutOfRange {
                field: "min_rpm",
                value: tokens[6].to_string(),
            });
        }
        let tolerance = float(tokens[7], "tolerance")?;
        if !(tolerance > 0.0 && tolerance < 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "tolerance",
                value: tokens[7].to_string(),
            });
        }
        let min_duty = float(tokens[8], "min_duty")?;
        if !(0.0..1.0).contains(&min_duty) {
            return Err(ConfigError::OutOfRange {
                field: "min_duty",
                value: tokens[8].to_string(),
            });
        }
        let max_fan_timeouts = positive_u32(tokens[9], "max_fan_timeouts")?;
        let pwm_pins = pins(tokens[10], active_fans, "pwm_pins")?;
        let tach_pins = pins(tokens[11], active_fans, "tach_pins")?;

        Ok(Self {
            mode,
            active_fans,
            pwm_freq_hz,
            tach_pulse_count,
            pulses_per_rev,
            max_rpm,
            min_rpm,
            tolerance,
            min_duty,
            max_fan_timeouts,
            pwm_pins,
            tach_pins,
        })
    }

    /// Wire form of this record; `parse` of the result yields an equal config.
    pub fn to_payload(&self) -> String {
        format!(
            "{} {} {} {} {} {} {} {} {} {} {} {}",
            self.mode.code(),
            self.active_fans,
            self.pwm_freq_hz,
            self.tach_pulse_count,
            self.pulses_per_rev,
            self.max_rpm,
            self.min_rpm,
            self.tolerance,
            self.min_duty,
            self.max_fan_timeouts,
            encode_pins(&self.pwm_pins),
            encode_pins(&self.tach_pins),
        )
    }

    /// Linear RPM-per-duty slope over the usable duty range.
    pub fn rpm_per_duty(&self) -> f64 {
        (self.max_rpm - self.min_rpm) as f64 / (1.0 - self.min_duty)
    }

    /// Absolute RPM window a chase is considered on-target inside.
    pub fn tolerance_band(&self) -> f64 {
        self.max_rpm as f64 * self.tolerance
    }
}

fn int(raw: &str, field: &'static str) -> Result<u64, ConfigError> {
    raw.parse::<u64>().map_err(|_| ConfigError::BadInt {
        field,
        value: raw.to_string(),
    })
}

fn positive_u32(raw: &str, field: &'static str) -> Result<u32, ConfigError> {
    let v = int(raw, field)?;
    if v == 0 || v > u32::MAX as u64 {
        return Err(ConfigError::OutOfRange {
            field,
            value: raw.to_string(),
        });
    }
    Ok(v as u32)
}

fn float(raw: &str, field: &'static str) -> Result<f64, ConfigError> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ConfigError::BadFloat {
            field,
            value: raw.to_string(),
        })
}

// Pin strings carry one printable char per fan, offset from '0' so pins
// past 9 stay single-character ('A' = 17, '[' = 43).
fn pins(raw: &str, expected: usize, field: &'static str) -> Result<Vec<u8>, ConfigError> {
    let decoded: Option<Vec<u8>> = raw
        .chars()
        .map(|c| {
            let v = c as u32;
            (('0' as u32..='~' as u32).contains(&v)).then(|| (v - '0' as u32) as u8)
        })
        .collect();
    let decoded = decoded.ok_or(ConfigError::OutOfRange {
        field,
        value: raw.to_string(),
    })?;
    if decoded.len() != expected {
        return Err(ConfigError::PinCount {
            field,
            expected,
            got: decoded.len(),
        });
    }
    Ok(decoded)
}

fn encode_pins(pins: &[u8]) -> String {
    pins.iter().map(|p| (p + b'0') as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r"1 4 5000 1 2 11500 1185 0.1 0.05 5 ABCD [\]^";

    #[test]
    fn parses_reference_record() {
        let cfg = ProcessorConfig::parse(PAYLOAD).unwrap();
        assert_eq!(cfg.mode, FanMode::Single);
        assert_eq!(cfg.active_fans, 4);
        assert_eq!(cfg.pwm_freq_hz, 5000);
        assert_eq!(cfg.max_rpm, 11500);
        assert_eq!(cfg.min_rpm, 1185);
        assert_eq!(cfg.tolerance, 0.1);
        assert_eq!(cfg.min_duty, 0.05);
        assert_eq!(cfg.max_fan_timeouts, 5);
        assert_eq!(cfg.pwm_pins, vec![17, 18, 19, 20]);
        assert_eq!(cfg.tach_pins, vec![43, 44, 45, 46]);
    }

    #[test]
    fn comma_delimited_is_equivalent() {
        let csv = PAYLOAD.replace(' ', ",");
        assert_eq!(
            ProcessorConfig::parse(&csv).unwrap(),
            ProcessorConfig::parse(PAYLOAD).unwrap()
        );
    }

    #[test]
    fn payload_roundtrip() {
        let cfg = ProcessorConfig::parse(PAYLOAD).unwrap();
        let reparsed = ProcessorConfig::parse(&cfg.to_payload()).unwrap();
        assert_eq!(cfg, reparsed);
    }

    #[test]
    fn slope_matches_linear_fit() {
        let cfg = ProcessorConfig::parse(PAYLOAD).unwrap();
        let expected = (11500.0 - 1185.0) / (1.0 - 0.05);
        assert!((cfg.rpm_per_duty() - expected).abs() < 1e-9);
        assert!((cfg.tolerance_band() - 1150.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_each_bad_field_without_partial_state() {
        let cases = [
            ("3 4 5000 1 2 11500 1185 0.1 0.05 5 ABCD [\\]^", "mode"),
            ("1 0 5000 1 2 11500 1185 0.1 0.05 5 ABCD [\\]^", "active_fans"),
            ("1 4 0 1 2 11500 1185 0.1 0.05 5 ABCD [\\]^", "pwm_freq_hz"),
            ("1 4 5000 1 2 1185 11500 0.1 0.05 5 ABCD [\\]^", "min_rpm"),
            ("1 4 5000 1 2 11500 1185 1.5 0.05 5 ABCD [\\]^", "tolerance"),
            ("1 4 5000 1 2 11500 1185 0.1 1.0 5 ABCD [\\]^", "min_duty"),
            ("1 4 5000 1 2 11500 1185 0.1 0.05 0 ABCD [\\]^", "max_fan_timeouts"),
        ];
        for (payload, field) in cases {
            let err = ProcessorConfig::parse(payload).unwrap_err();
            match err {
                ConfigError::OutOfRange { field: f, .. } => assert_eq!(f, field),
                other => panic!("{payload}: unexpected error {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_wrong_field_count_and_pin_width() {
        assert!(matches!(
            ProcessorConfig::parse("1 4 5000"),
            Err(ConfigError::FieldCount { .. })
        ));
        assert!(matches!(
            ProcessorConfig::parse(r"1 4 5000 1 2 11500 1185 0.1 0.05 5 ABC [\]^"),
            Err(ConfigError::PinCount {
                field: "pwm_pins",
                expected: 4,
                got: 3,
            })
        ));
    }

    #[test]
    fn rejects_non_numeric_fields() {
        assert!(matches!(
            ProcessorConfig::parse(r"x 4 5000 1 2 11500 1185 0.1 0.05 5 ABCD [\]^"),
            Err(ConfigError::BadInt { field: "mode", .. })
        ));
        assert!(matches!(
            ProcessorConfig::parse(r"1 4 5000 1 2 11500 1185 wide 0.05 5 ABCD [\]^"),
            Err(ConfigError::BadFloat {
                field: "tolerance",
                ..
            })
        ));
    }
}
