//! The persisted sample record.

use crate::experiment::ExperimentId;
use crate::instrument::InstrumentId;
use crate::scpi::SampleReply;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Column names, in serialization order.
pub const SAMPLE_COLUMNS: [&str; 13] = [
    "experiment_id",
    "instrument_id",
    "recorded_at",
    "device_time",
    "voltage",
    "current",
    "charge",
    "resistance",
    "source",
    "math_value",
    "temperature",
    "humidity",
    "error_code",
];

/// One decoded reading, attributed to an experiment and an instrument.
///
/// Append-only: created once per successful decode, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Experiment the reading was taken for
    pub experiment_id: ExperimentId,
    /// Instrument that produced it
    pub instrument_id: InstrumentId,
    /// Controller wall clock at decode time
    pub recorded_at: DateTime<Utc>,
    /// Instrument clock text, verbatim
    pub device_time: String,
    /// Volts
    pub voltage: f64,
    /// Amperes
    pub current: f64,
    /// Coulombs
    pub charge: f64,
    /// Ohms
    pub resistance: f64,
    /// Source output setting
    pub source: f64,
    /// Result of the instrument's math function
    pub math_value: f64,
    /// Degrees Celsius
    pub temperature: f64,
    /// Relative humidity, percent
    pub humidity: f64,
    /// Instrument error state; 0 when clear
    pub error_code: i32,
}

impl Sample {
    /// Attach identity and a timestamp to a decoded reply.
    pub fn from_reply(
        experiment_id: ExperimentId,
        instrument_id: InstrumentId,
        reply: SampleReply,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            experiment_id,
            instrument_id,
            recorded_at,
            device_time: reply.device_time,
            voltage: reply.voltage,
            current: reply.current,
            charge: reply.charge,
            resistance: reply.resistance,
            source: reply.source,
            math_value: reply.math_value,
            temperature: reply.temperature,
            humidity: reply.humidity,
            error_code: reply.error_code,
        }
    }
}
