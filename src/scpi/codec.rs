//! Wire commands and reply decoding.
//!
//! The instrument speaks a small fixed command set. Two of the commands answer
//! with comma-separated text that is decoded here into typed replies; the rest
//! are fire-and-forget.

use crate::error::{DaqError, DaqResult};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;

/// Number of fields in a `FETCH:ALL_S?` reply.
pub const SAMPLE_FIELD_COUNT: usize = 10;

/// Plain decimal notation: optional sign, digits with optional fraction, optional exponent.
static DECIMAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(?:\d+(?:\.\d*)?|\.\d+)(?:[eE][+-]?\d+)?$").expect("Invalid decimal regex")
});

static INTEGER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?\d+$").expect("Invalid integer regex"));

/// The fixed set of wire commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `*IDN?` - identification query
    Identify,
    /// `FETCH:ALL_S?` - one full sample
    FetchAll,
    /// `FUNC:RUN` - start measuring
    Run,
    /// `FUNC:STOP` - stop measuring
    Stop,
    /// `HAND:ERROR` - acknowledge and clear the error state
    ClearError,
}

impl Command {
    /// Wire text of the command, without terminator.
    pub const fn as_str(self) -> &'static str {
        match self {
            Command::Identify => "*IDN?",
            Command::FetchAll => "FETCH:ALL_S?",
            Command::Run => "FUNC:RUN",
            Command::Stop => "FUNC:STOP",
            Command::ClearError => "HAND:ERROR",
        }
    }

    /// Whether the instrument answers this command.
    pub const fn expects_reply(self) -> bool {
        matches!(self, Command::Identify | Command::FetchAll)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded `*IDN?` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentificationReply {
    /// Model name, first field
    pub model: String,
    /// Firmware version, second field
    pub firmware: String,
    /// Serial number, third field
    pub serial: String,
    /// Reply exactly as received (trimmed)
    pub raw: String,
}

/// Decoded `FETCH:ALL_S?` reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleReply {
    /// Volts
    pub voltage: f64,
    /// Amperes
    pub current: f64,
    /// Coulombs
    pub charge: f64,
    /// Ohms
    pub resistance: f64,
    /// Device clock text, kept verbatim
    pub device_time: String,
    /// Source output setting
    pub source: f64,
    /// Result of the math function
    pub math_value: f64,
    /// Degrees Celsius
    pub temperature: f64,
    /// Relative humidity, percent
    pub humidity: f64,
    /// 0 when the instrument reports no error
    pub error_code: i32,
}

/// Decode an identification reply: `model,firmware,serial[,...]`.
///
/// Missing trailing fields come back empty; fields past the third are ignored.
pub fn parse_identification(raw: &str) -> DaqResult<IdentificationReply> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(DaqError::decode(raw, "empty identification"));
    }

    let mut fields = raw.split(',').map(str::trim);
    let mut next = || fields.next().unwrap_or_default().to_string();

    Ok(IdentificationReply {
        model: next(),
        firmware: next(),
        serial: next(),
        raw: raw.to_string(),
    })
}

/// Decode a sample reply.
///
/// Field order: voltage, current, charge, resistance, device time, source, math,
/// temperature, humidity, error code. Decoding stops at the first bad field.
pub fn parse_sample(raw: &str) -> DaqResult<SampleReply> {
    let raw = raw.trim();
    let fields: Vec<&str> = raw.split(',').map(str::trim).collect();
    if fields.len() < SAMPLE_FIELD_COUNT {
        return Err(DaqError::decode(
            raw,
            format!(
                "expected {} fields, got {}",
                SAMPLE_FIELD_COUNT,
                fields.len()
            ),
        ));
    }

    Ok(SampleReply {
        voltage: decimal(raw, "voltage", fields[0])?,
        current: decimal(raw, "current", fields[1])?,
        charge: decimal(raw, "charge", fields[2])?,
        resistance: decimal(raw, "resistance", fields[3])?,
        device_time: fields[4].to_string(),
        source: decimal(raw, "source", fields[5])?,
        math_value: decimal(raw, "math", fields[6])?,
        temperature: decimal(raw, "temperature", fields[7])?,
        humidity: decimal(raw, "humidity", fields[8])?,
        error_code: integer(raw, "error_code", fields[9])?,
    })
}

fn decimal(raw: &str, name: &str, field: &str) -> DaqResult<f64> {
    if !DECIMAL_REGEX.is_match(field) {
        return Err(DaqError::decode(raw, format!("invalid {} {:?}", name, field)));
    }
    field
        .parse::<f64>()
        .map_err(|e| DaqError::decode(raw, format!("invalid {} {:?}: {}", name, field, e)))
}

fn integer(raw: &str, name: &str, field: &str) -> DaqResult<i32> {
    if !INTEGER_REGEX.is_match(field) {
        return Err(DaqError::decode(raw, format!("invalid {} {:?}", name, field)));
    }
    field
        .parse::<i32>()
        .map_err(|e| DaqError::decode(raw, format!("invalid {} {:?}: {}", name, field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(err: DaqError) -> String {
        match err {
            DaqError::ProtocolDecode { reason, .. } => reason,
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn decodes_well_formed_sample() {
        let reply = parse_sample("1.234,-0.001,0.0,1000000,12:00:00,0,0,25.5,40.0,0").unwrap();
        assert_eq!(reply.voltage, 1.234);
        assert_eq!(reply.current, -0.001);
        assert_eq!(reply.charge, 0.0);
        assert_eq!(reply.resistance, 1_000_000.0);
        assert_eq!(reply.device_time, "12:00:00");
        assert_eq!(reply.source, 0.0);
        assert_eq!(reply.math_value, 0.0);
        assert_eq!(reply.temperature, 25.5);
        assert_eq!(reply.humidity, 40.0);
        assert_eq!(reply.error_code, 0);
    }

    #[test]
    fn trims_fields_and_accepts_exponents() {
        let reply =
            parse_sample(" +1.5E-3 , 2e2, .5, 7., 2024-01-09 08:15:00 ,1,-2,3,4, -17 \r\n").unwrap();
        assert_eq!(reply.voltage, 1.5e-3);
        assert_eq!(reply.current, 200.0);
        assert_eq!(reply.charge, 0.5);
        assert_eq!(reply.resistance, 7.0);
        assert_eq!(reply.device_time, "2024-01-09 08:15:00");
        assert_eq!(reply.error_code, -17);
    }

    #[test]
    fn short_reply_reports_field_count() {
        let err = parse_sample("1.0,2.0,3.0").unwrap_err();
        match err {
            DaqError::ProtocolDecode { raw, reason } => {
                assert_eq!(raw, "1.0,2.0,3.0");
                assert!(reason.contains("got 3"), "{reason}");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        for short in ["", "1", "1,2,3,4,5,6,7,8,9"] {
            assert!(parse_sample(short).is_err(), "{short:?} should not decode");
        }
    }

    #[test]
    fn first_bad_field_is_named() {
        let err = parse_sample("1.0,abc,3.0,4.0,t,6,7,8,9,0").unwrap_err();
        assert!(reason(err).contains("current"));

        // Two bad fields: only the earlier one is reported
        let err = parse_sample("1.0,2.0,3.0,4.0,t,6,x,8,y,0").unwrap_err();
        assert!(reason(err).contains("math"));
    }

    #[test]
    fn rejects_non_decimal_notation() {
        for bad in ["inf", "NaN", "0x10", "1_000", "--1", "1e", ""] {
            let raw = format!("{bad},0,0,0,t,0,0,0,0,0");
            assert!(
                reason(parse_sample(&raw).unwrap_err()).contains("voltage"),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn error_code_must_be_integer() {
        let err = parse_sample("1,2,3,4,t,6,7,8,9,1.5").unwrap_err();
        assert!(reason(err).contains("error_code"));

        let err = parse_sample("1,2,3,4,t,6,7,8,9,99999999999").unwrap_err();
        assert!(reason(err).contains("error_code"));
    }

    #[test]
    fn extra_sample_fields_are_ignored() {
        let reply = parse_sample("1,2,3,4,t,6,7,8,9,0,extra,fields").unwrap();
        assert_eq!(reply.error_code, 0);
        assert_eq!(reply.humidity, 9.0);
    }

    #[test]
    fn decodes_identification() {
        let idn = parse_identification("TH2690,V1.0.22,R08C240109").unwrap();
        assert_eq!(idn.model, "TH2690");
        assert_eq!(idn.firmware, "V1.0.22");
        assert_eq!(idn.serial, "R08C240109");
        assert_eq!(idn.raw, "TH2690,V1.0.22,R08C240109");
    }

    #[test]
    fn identification_tolerates_missing_and_extra_fields() {
        let idn = parse_identification("Keithley 2450, 1.7.3").unwrap();
        assert_eq!(idn.model, "Keithley 2450");
        assert_eq!(idn.firmware, "1.7.3");
        assert_eq!(idn.serial, "");

        let idn = parse_identification("Red Pitaya,MOCK,00000,0.0.0").unwrap();
        assert_eq!(idn.serial, "00000");
    }

    #[test]
    fn empty_identification_is_decode_error() {
        for raw in ["", "   \r\n"] {
            let err = parse_identification(raw).unwrap_err();
            assert_eq!(reason(err), "empty identification");
        }
    }

    #[test]
    fn only_queries_expect_replies() {
        assert!(Command::Identify.expects_reply());
        assert!(Command::FetchAll.expects_reply());
        assert!(!Command::Run.expects_reply());
        assert!(!Command::Stop.expects_reply());
        assert!(!Command::ClearError.expects_reply());
        assert_eq!(Command::FetchAll.to_string(), "FETCH:ALL_S?");
    }
}
