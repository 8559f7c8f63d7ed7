//! Status uplink frames: `INDEX|T|rpm_csv|duty_csv`.
//!
//! A `T` frame with no data fields (`INDEX|T`) is the maintain/keep-alive
//! form the uplink falls back to when the control loop has not produced a
//! fresh report inside one period.

use crate::wire::WireError;

/// One control-loop status snapshot: per-fan RPM and duty vectors plus the
/// processor's own data index. The wire `INDEX` is stamped separately by
/// the uplink sender.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub data_index: u64,
    pub rpm: Vec<u32>,
    pub duty: Vec<f64>,
}

impl StatusReport {
    pub fn to_frame(&self, wire_index: u64) -> String {
        let rpm_csv: Vec<String> = self.rpm.iter().map(|r| r.to_string()).collect();
        let duty_csv: Vec<String> = self.duty.iter().map(|d| format!("{d:.3}")).collect();
        format!("{wire_index}|T|{}|{}", rpm_csv.join(","), duty_csv.join(","))
    }

    /// Keep-alive frame carrying only the wire index.
    pub fn maintain_frame(wire_index: u64) -> String {
        format!("{wire_index}|T")
    }

    /// Master-side parse. `Ok((index, None))` is a maintain frame.
    pub fn parse_frame(raw: &str) -> Result<(u64, Option<StatusReport>), WireError> {
        let raw = raw.trim_end_matches(['\r', '\n']);
        if raw.is_empty() {
            return Err(WireError::Empty);
        }
        let fields: Vec<&str> = raw.split('|').collect();
        if fields.len() != 2 && fields.len() != 4 {
            return Err(WireError::MissingField("rpm_csv"));
        }
        let index = fields[0].parse::<u64>().map_err(|_| WireError::BadInt {
            field: "index",
            value: fields[0].to_string(),
        })?;
        if fields[1] != "T" {
            return Err(WireError::UnknownSpec(fields[1].to_string()));
        }
        if fields.len() == 2 {
            return Ok((index, None));
        }
        let rpm = fields[2]
            .split(',')
            .map(|r| {
                r.parse::<u32>().map_err(|_| WireError::BadInt {
                    field: "rpm",
                    value: r.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let duty = fields[3]
            .split(',')
            .map(|d| {
                d.parse::<f64>().map_err(|_| WireError::BadFloat {
                    field: "duty",
                    value: d.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((
            index,
            Some(StatusReport {
                data_index: index,
                rpm,
                duty,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let report = StatusReport {
            data_index: 12,
            rpm: vec![5980, 6010, 0, 11490],
            duty: vec![0.52, 0.523, 0.0, 1.0],
        };
        let frame = report.to_frame(42);
        assert_eq!(frame, "42|T|5980,6010,0,11490|0.520,0.523,0.000,1.000");

        let (index, parsed) = StatusReport::parse_frame(&frame).unwrap();
        let parsed = parsed.unwrap();
        assert_eq!(index, 42);
        assert_eq!(parsed.rpm, report.rpm);
        for (a, b) in parsed.duty.iter().zip(&report.duty) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn maintain_frame_parses_as_keepalive() {
        let frame = StatusReport::maintain_frame(7);
        assert_eq!(frame, "7|T");
        assert_eq!(StatusReport::parse_frame(&frame).unwrap(), (7, None));
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(StatusReport::parse_frame("1|T|1,2").is_err());
        assert!(StatusReport::parse_frame("x|T|1|0.1").is_err());
        assert!(StatusReport::parse_frame("1|B|1|0.1").is_err());
        assert!(StatusReport::parse_frame("1|T|one,two|0.1,0.2").is_err());
    }
}
