//! # PV Production Simulation
//!
//! Models rooftop PV output as a Gaussian bell centred on the configured peak hour.
//!
//! Production is hard-gated to the configured generation window: a Gaussian never reaches
//! zero on its own, so night time is modelled by the gate rather than by the curve. Inside
//! the window the ideal curve is scaled by a weather factor in `[0.3, 1.2]` that only
//! changes from one wall-clock minute to the next.

use chrono::{NaiveDateTime, Timelike};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::round_kw;

pub const MIN_WEATHER_FACTOR: f64 = 0.3;
pub const MAX_WEATHER_FACTOR: f64 = 1.2;

/// Anything that can report PV production for a local time of day
pub trait SolarSource: Send + Sync {
    /// Production in kW at `at`, rounded to 10 W
    fn generate(&self, at: NaiveDateTime) -> f64;
}

/// PV simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvSimulatorConfig {
    /// Decimal hour production starts (0.0 kW before)
    pub power_gen_start: f64,
    /// Decimal hour production stops (0.0 kW after)
    pub power_gen_stop: f64,
    /// Decimal hour of peak production
    pub peak_hour: f64,
    /// Peak production in kW under a neutral weather factor
    pub max_power_kw: f64,
    /// Width of the bell curve in hours
    pub sigma: f64,
    /// Seed for the per-minute weather factor (None = random)
    pub weather_seed: Option<u64>,
}

impl Default for PvSimulatorConfig {
    fn default() -> Self {
        Self {
            power_gen_start: 6.0,
            power_gen_stop: 19.0,
            peak_hour: 12.5,
            max_power_kw: 8.0, // medium domestic installation
            sigma: 3.5,
            weather_seed: None,
        }
    }
}

pub struct PvSimulator {
    config: PvSimulatorConfig,
    weather_seed: u64,
}

impl PvSimulator {
    pub fn new(config: PvSimulatorConfig) -> Self {
        let weather_seed = config.weather_seed.unwrap_or_else(rand::random);
        Self {
            config,
            weather_seed,
        }
    }

    pub fn config(&self) -> &PvSimulatorConfig {
        &self.config
    }

    /// Whether `hour` lies inside the generation window (bounds inclusive)
    pub fn is_generating(&self, hour: f64) -> bool {
        hour >= self.config.power_gen_start && hour <= self.config.power_gen_stop
    }

    /// Ideal bell-curve output in kW for a decimal hour, ignoring the gate and weather
    pub fn clear_sky_kw(&self, hour: f64) -> f64 {
        let offset = hour - self.config.peak_hour;
        let sigma = self.config.sigma;
        self.config.max_power_kw * (-(offset * offset) / (2.0 * sigma * sigma)).exp()
    }

    /// Weather factor for the minute containing `at`.
    ///
    /// Every instant within the same minute maps to the same PRNG stream and therefore the
    /// same factor.
    pub fn weather_factor(&self, at: NaiveDateTime) -> f64 {
        let minute_bucket = at.and_utc().timestamp().div_euclid(60) as u64;
        let mut rng = StdRng::seed_from_u64(
            self.weather_seed ^ minute_bucket.wrapping_mul(0x9E37_79B9_7F4A_7C15),
        );
        let roll: i32 = rng.gen_range(0..100);
        (1.0 + f64::from(roll - 50) / 200.0).clamp(MIN_WEATHER_FACTOR, MAX_WEATHER_FACTOR)
    }

    /// Production in kW at `at`
    pub fn generate(&self, at: NaiveDateTime) -> f64 {
        let hour = decimal_hour(at);
        if !self.is_generating(hour) {
            return 0.0;
        }

        let power = self.clear_sky_kw(hour) * self.weather_factor(at);
        round_kw(power.max(0.0))
    }
}

impl SolarSource for PvSimulator {
    fn generate(&self, at: NaiveDateTime) -> f64 {
        PvSimulator::generate(self, at)
    }
}

/// Hour of day with minute resolution, e.g. 12:30 -> 12.5
pub fn decimal_hour(at: NaiveDateTime) -> f64 {
    f64::from(at.hour()) + f64::from(at.minute()) / 60.0
}
