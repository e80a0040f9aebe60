//! # Signal Simulation Module
//!
//! Synthetic signal sources for the two ends of the pipeline.
//!
//! ## Components
//!
//! - **Meter**: Household consumption as a bounded random walk over a constant baseline
//! - **PV**: Bell-shaped solar production gated to daylight hours, perturbed by a weather factor
//!   that stays fixed for a whole minute
//!
//! ## Usage
//!
//! ```rust
//! use chrono::NaiveDate;
//! use home_pv_telemetry::simulation::{
//!     MeterKind, MeterSimulator, MeterSimulatorConfig, PvSimulator, PvSimulatorConfig,
//! };
//!
//! let mut meter = MeterSimulator::new(
//!     MeterKind::Residential,
//!     MeterSimulatorConfig { random_seed: Some(7), ..Default::default() },
//! );
//! let consumption_kw = meter.next_reading();
//!
//! let pv = PvSimulator::new(PvSimulatorConfig { weather_seed: Some(7), ..Default::default() });
//! let noon = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap().and_hms_opt(12, 30, 0).unwrap();
//! let production_kw = pv.generate(noon);
//! assert!(production_kw > 0.0 && consumption_kw >= 0.0);
//! ```

pub mod meter;
pub mod pv;

pub use meter::{MeterKind, MeterSimulator, MeterSimulatorConfig, ResidentialMeterSimulator};
pub use pv::{decimal_hour, PvSimulator, PvSimulatorConfig, SolarSource};

/// Round a power value to two decimal places (10 W resolution)
pub fn round_kw(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
