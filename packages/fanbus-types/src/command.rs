//! Command bodies carried inside `INDEX|S|...` frames.
//!
//! A body is `CODE:ARG1:ARG2:...` with single-character codes:
//! `D` = write duty cycle, `C` = chase RPM, `F` = multi-write one duty per
//! fan. The historical character codes are preserved for wire compatibility;
//! in-process they are a closed enum.

use crate::config::ProcessorConfig;
use crate::wire::WireError;

/// Widest fan bank any protocol generation addresses.
pub const MAX_FANS: usize = 16;

// ── Fan selection mask ────────────────────────────────────────────────────────

/// Fixed-width bitset selecting which fans a command applies to.
///
/// Wire form is a `0`/`1` string keyed by fan position: `"1100"` selects
/// fans 0 and 1 of a four-fan bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanMask {
    bits: u16,
    width: u8,
}

impl FanMask {
    /// Parse a fixed-width `0`/`1` selection string.
    pub fn parse(s: &str) -> Result<Self, WireError> {
        if s.is_empty() || s.len() > MAX_FANS {
            return Err(WireError::BadMask(s.to_string()));
        }
        let mut bits = 0u16;
        for (i, c) in s.chars().enumerate() {
            match c {
                '1' => bits |= 1 << i,
                '0' => {}
                _ => return Err(WireError::BadMask(s.to_string())),
            }
        }
        Ok(Self { bits, width: s.len() as u8 })
    }

    /// Mask selecting every fan of a `width`-fan bank.
    pub fn all(width: usize) -> Self {
        let width = width.min(MAX_FANS);
        Self {
            bits: if width == 16 { u16::MAX } else { (1u16 << width) - 1 },
            width: width as u8,
        }
    }

    pub fn is_set(&self, fan: usize) -> bool {
        fan < self.width as usize && self.bits & (1 << fan) != 0
    }

    pub fn width(&self) -> usize {
        self.width as usize
    }

    /// Indices of the selected fans, ascending.
    pub fn selected(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.width as usize).filter(|&i| self.bits & (1 << i) != 0)
    }

    pub fn encode(&self) -> String {
        (0..self.width as usize)
            .map(|i| if self.bits & (1 << i) != 0 { '1' } else { '0' })
            .collect()
    }
}

// ── Command ───────────────────────────────────────────────────────────────────

/// One command from the Master to the command processor.
///
/// `Configure` has no `S`-frame code: its wire form is the processor-config
/// segment of the handshake payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `D:<duty>:<mask>` — set an open-loop duty cycle on the selected fans.
    Write { duty: f64, mask: FanMask },
    /// `C:<rpm>:<mask>` — chase a target RPM on the selected fans.
    Chase { target_rpm: u32, mask: FanMask },
    /// `F:<d0>:<d1>:...` — one duty cycle per active fan, all or nothing.
    MultiWrite { duties: Vec<f64> },
    /// Replace the processor configuration (handshake path only).
    Configure(ProcessorConfig),
}

impl Command {
    /// Parse an `S`-frame body.
    pub fn parse_body(body: &str) -> Result<Self, WireError> {
        let mut parts = body.split(':');
        let code = parts.next().ok_or(WireError::Empty)?;
        match code {
            "D" => {
                let duty = parse_duty(parts.next(), "duty")?;
                let mask = FanMask::parse(parts.next().ok_or(WireError::MissingField("mask"))?)?;
                Ok(Command::Write { duty, mask })
            }
            "C" => {
                let raw = parts.next().ok_or(WireError::MissingField("target_rpm"))?;
                let target_rpm = raw.parse::<u32>().map_err(|_| WireError::BadInt {
                    field: "target_rpm",
                    value: raw.to_string(),
                })?;
                let mask = FanMask::parse(parts.next().ok_or(WireError::MissingField("mask"))?)?;
                Ok(Command::Chase { target_rpm, mask })
            }
            "F" => {
                let duties = parts
                    .map(|p| parse_duty(Some(p), "duty"))
                    .collect::<Result<Vec<_>, _>>()?;
                if duties.is_empty() {
                    return Err(WireError::MissingField("duty"));
                }
                Ok(Command::MultiWrite { duties })
            }
            other => Err(WireError::UnknownCommand(other.to_string())),
        }
    }

    /// Wire body for `D`/`C`/`F` commands. `Configure` travels inside the
    /// handshake frame instead and yields `None`.
    pub fn format_body(&self) -> Option<String> {
        match self {
            Command::Write { duty, mask } => Some(format!("D:{}:{}", duty, mask.encode())),
            Command::Chase { target_rpm, mask } => {
                Some(format!("C:{}:{}", target_rpm, mask.encode()))
            }
            Command::MultiWrite { duties } => {
                let csv: Vec<String> = duties.iter().map(|d| d.to_string()).collect();
                Some(format!("F:{}", csv.join(":")))
            }
            Command::Configure(_) => None,
        }
    }
}

fn parse_duty(raw: Option<&str>, field: &'static str) -> Result<f64, WireError> {
    let raw = raw.ok_or(WireError::MissingField(field))?;
    raw.parse::<f64>()
        .ok()
        .filter(|d| d.is_finite())
        .ok_or_else(|| WireError::BadFloat {
            field,
            value: raw.to_string(),
        })
}
