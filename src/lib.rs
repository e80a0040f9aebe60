//! Household meter / PV telemetry simulator.
//!
//! A meter process publishes simulated consumption readings on a per-site queue; a PV
//! process consumes them, joins each one with the simulated solar output for the moment it
//! arrived and appends the resulting net-power record to a per-session CSV log.

pub mod clock;
pub mod config;
pub mod consumer;
pub mod domain;
pub mod error;
pub mod producer;
pub mod session_log;
pub mod simulation;
pub mod telemetry;
pub mod transport;

pub use error::TelemetryError;
