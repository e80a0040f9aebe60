use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::message::{wire_timestamp, TelemetryMessage};
use crate::simulation::round_kw;

/// One row of the session log: a meter reading joined with PV output at arrival time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyRecord {
    /// Sample time reported by the meter
    #[serde(with = "wire_timestamp")]
    pub timestamp: NaiveDateTime,
    pub meter_power_kw: f64,
    pub pv_power_kw: f64,
    /// Positive when the house exports to the grid, negative when it imports
    pub net_power_kw: f64,
}

impl EnergyRecord {
    pub fn join(message: &TelemetryMessage, pv_power_kw: f64) -> Self {
        Self {
            timestamp: message.timestamp,
            meter_power_kw: round_kw(message.meter_power_kw),
            pv_power_kw: round_kw(pv_power_kw),
            net_power_kw: round_kw(pv_power_kw - message.meter_power_kw),
        }
    }

    pub fn is_exporting(&self) -> bool {
        self.net_power_kw > 0.0
    }
}
