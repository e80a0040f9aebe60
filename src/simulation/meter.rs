//! # Household Meter Simulation
//!
//! Models household electricity consumption as two components:
//!
//! - a constant **baseline** (fridge, router, standby loads that never switch off)
//! - a **variable** part that drifts as appliances turn on and off
//!
//! The variable part follows a random walk whose step is capped both absolutely (0.5 kW)
//! and relatively (10% of its current level), so consecutive readings change smoothly
//! instead of jumping around.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::round_kw;
use crate::error::TelemetryError;

/// Largest change of the variable load between two readings, in kW
const MAX_STEP_KW: f64 = 0.5;
/// Largest change relative to the current variable load
const MAX_STEP_FRACTION: f64 = 0.1;

/// Kind of building whose consumption is simulated
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum MeterKind {
    /// Single household
    Residential,
}

impl MeterKind {
    /// Parse a configured meter type tag
    pub fn from_tag(tag: &str) -> Result<Self, TelemetryError> {
        tag.trim()
            .parse()
            .map_err(|_| TelemetryError::UnsupportedMeterKind(tag.to_string()))
    }

    /// `type` tag carried by every message this kind of meter publishes
    pub fn message_type(&self) -> &'static str {
        match self {
            MeterKind::Residential => "residential_meter_reading",
        }
    }
}

/// Meter simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterSimulatorConfig {
    /// Always-on consumption in kW (typical household: 0.5-1.5 kW)
    pub baseline_kw: f64,
    /// Lower bound for emitted readings in kW
    pub min_power_kw: f64,
    /// Upper bound for emitted readings in kW
    pub max_power_kw: f64,
    /// Range the variable load is initially drawn from, in kW
    pub initial_variable_kw: (f64, f64),
    /// Random seed for reproducibility (None = random)
    pub random_seed: Option<u64>,
}

impl Default for MeterSimulatorConfig {
    fn default() -> Self {
        Self {
            baseline_kw: 1.0,
            min_power_kw: 0.0,
            max_power_kw: 10.0,
            initial_variable_kw: (0.5, 3.0),
            random_seed: None,
        }
    }
}

/// Random-walk consumption model for a single household
pub struct ResidentialMeterSimulator {
    baseline_kw: f64,
    variable_kw: f64,
    min_power_kw: f64,
    max_power_kw: f64,
    rng: StdRng,
}

impl ResidentialMeterSimulator {
    pub fn new(config: MeterSimulatorConfig) -> Self {
        let mut rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let (low, high) = config.initial_variable_kw;
        let initial = if high > low {
            rng.gen_range(low..=high)
        } else {
            low
        };

        Self {
            baseline_kw: config.baseline_kw,
            variable_kw: initial.clamp(0.0, variable_ceiling(&config)),
            min_power_kw: config.min_power_kw,
            max_power_kw: config.max_power_kw,
            rng,
        }
    }

    /// Advance the random walk by one step and return the total consumption in kW
    pub fn next_reading(&mut self) -> f64 {
        let max_step = MAX_STEP_KW.min(self.variable_kw * MAX_STEP_FRACTION);
        let delta = if max_step > 0.0 {
            self.rng.gen_range(-max_step..=max_step)
        } else {
            0.0
        };

        // The variable part may collapse to zero (everything switched off) but never
        // pushes the total above the configured ceiling.
        let ceiling = (self.max_power_kw - self.baseline_kw).max(0.0);
        self.variable_kw = (self.variable_kw + delta).clamp(0.0, ceiling);

        // An inverted floor/ceiling pair resolves to the ceiling
        let total = (self.baseline_kw + self.variable_kw)
            .max(self.min_power_kw)
            .min(self.max_power_kw);
        round_kw(total)
    }

    pub fn baseline_kw(&self) -> f64 {
        self.baseline_kw
    }

    pub fn variable_kw(&self) -> f64 {
        self.variable_kw
    }
}

fn variable_ceiling(config: &MeterSimulatorConfig) -> f64 {
    (config.max_power_kw - config.baseline_kw).max(0.0)
}

/// Meter simulator selected by [`MeterKind`]
pub enum MeterSimulator {
    Residential(ResidentialMeterSimulator),
}

impl MeterSimulator {
    pub fn new(kind: MeterKind, config: MeterSimulatorConfig) -> Self {
        match kind {
            MeterKind::Residential => Self::Residential(ResidentialMeterSimulator::new(config)),
        }
    }

    /// Build a simulator from a configured type tag such as `"RESIDENTIAL"`
    pub fn from_tag(tag: &str, config: MeterSimulatorConfig) -> Result<Self, TelemetryError> {
        Ok(Self::new(MeterKind::from_tag(tag)?, config))
    }

    pub fn kind(&self) -> MeterKind {
        match self {
            Self::Residential(_) => MeterKind::Residential,
        }
    }

    pub fn next_reading(&mut self) -> f64 {
        match self {
            Self::Residential(sim) => sim.next_reading(),
        }
    }
}
