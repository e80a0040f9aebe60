use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Local timestamp layout used on the wire and in the session log
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Errors raised while encoding or decoding a meter message
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Invalid meter power: {0} kW (must be a finite, non-negative value)")]
    InvalidPower(f64),
}

/// Meter reading as published on the queue.
///
/// ```json
/// {"meter_id": "meter0", "timestamp": "2024-01-01T12:30:00", "meter_power_kw": 3.5, "type": "residential_meter_reading"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub meter_id: String,
    #[serde(with = "wire_timestamp")]
    pub timestamp: NaiveDateTime,
    pub meter_power_kw: f64,
    #[serde(rename = "type")]
    pub message_type: String,
}

impl TelemetryMessage {
    /// Build a message; the timestamp is truncated to whole seconds
    pub fn new(
        meter_id: impl Into<String>,
        timestamp: NaiveDateTime,
        meter_power_kw: f64,
        message_type: impl Into<String>,
    ) -> Self {
        Self {
            meter_id: meter_id.into(),
            timestamp: timestamp.with_nanosecond(0).unwrap_or(timestamp),
            meter_power_kw,
            message_type: message_type.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and validate a payload received from the queue
    pub fn from_slice(payload: &[u8]) -> Result<Self, MessageError> {
        let message: Self = serde_json::from_slice(payload)?;
        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<(), MessageError> {
        if !self.meter_power_kw.is_finite() || self.meter_power_kw < 0.0 {
            return Err(MessageError::InvalidPower(self.meter_power_kw));
        }
        Ok(())
    }
}

/// Serde adapter for `YYYY-MM-DDTHH:MM:SS` local timestamps
pub(crate) mod wire_timestamp {
    use super::TIMESTAMP_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(timestamp: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&timestamp.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT).map_err(serde::de::Error::custom)
    }
}
