use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use validator::{Validate, ValidationError};

use crate::simulation::{MeterSimulatorConfig, PvSimulatorConfig};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const ENV_PREFIX: &str = "PVSIM__";

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub meter: MeterConfig,
    #[validate(nested)]
    pub pv: PvConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_meter_bounds"))]
pub struct MeterConfig {
    #[validate(length(min = 1))]
    pub id: String,
    /// PV site this meter reports to; selects the queue
    #[validate(length(min = 1))]
    pub pv_id: String,
    #[serde(default = "default_meter_type")]
    pub meter_type: String,
    #[validate(range(min = 0.0))]
    pub baseline: f64,
    #[validate(range(min = 0.0))]
    pub min_power: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub max_power: f64,
    #[validate(range(min = 1))]
    pub meter_interval_sec: u64,
    #[serde(default = "default_initial_variable_min")]
    pub initial_variable_min: f64,
    #[serde(default = "default_initial_variable_max")]
    pub initial_variable_max: f64,
    #[serde(default)]
    pub random_seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_generation_window"))]
pub struct PvConfig {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(range(min = 0.0, exclusive_max = 24.0))]
    pub power_gen_start: f64,
    #[validate(range(min = 0.0, exclusive_max = 24.0))]
    pub power_gen_stop: f64,
    #[validate(range(min = 0.0, exclusive_max = 24.0))]
    pub peak_hour: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub max_power: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub sigma: f64,
    #[serde(default)]
    pub weather_seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Nats,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    #[serde(default = "default_transport_url")]
    pub url: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            url: default_transport_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_meter_type() -> String {
    "RESIDENTIAL".to_string()
}
fn default_initial_variable_min() -> f64 {
    0.5
}
fn default_initial_variable_max() -> f64 {
    3.0
}
fn default_transport_url() -> String {
    "nats://localhost:4222".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn validate_meter_bounds(cfg: &MeterConfig) -> Result<(), ValidationError> {
    if cfg.baseline >= cfg.max_power {
        return Err(invalid("meter_bounds", "baseline must be below max_power"));
    }
    if cfg.min_power > cfg.max_power {
        return Err(invalid("meter_bounds", "min_power must not exceed max_power"));
    }
    if cfg.initial_variable_min < 0.0 || cfg.initial_variable_min > cfg.initial_variable_max {
        return Err(invalid(
            "meter_bounds",
            "initial variable range must satisfy 0 <= min <= max",
        ));
    }
    Ok(())
}

fn validate_generation_window(cfg: &PvConfig) -> Result<(), ValidationError> {
    if cfg.power_gen_start < cfg.peak_hour && cfg.peak_hour < cfg.power_gen_stop {
        Ok(())
    } else {
        Err(invalid(
            "generation_window",
            "power_gen_start < peak_hour < power_gen_stop is required",
        ))
    }
}

fn invalid(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(message.into());
    err
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// TOML file overlaid with `PVSIM__SECTION__KEY` environment variables
    pub fn load_from(path: &Path) -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
            .with_context(|| format!("invalid configuration in {}", path.display()))
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::extract(Figment::new().merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let cfg: Config = figment.extract()?;
        cfg.validate()?;
        Ok(cfg)
    }
}

impl From<&MeterConfig> for MeterSimulatorConfig {
    fn from(cfg: &MeterConfig) -> Self {
        Self {
            baseline_kw: cfg.baseline,
            min_power_kw: cfg.min_power,
            max_power_kw: cfg.max_power,
            initial_variable_kw: (cfg.initial_variable_min, cfg.initial_variable_max),
            random_seed: cfg.random_seed,
        }
    }
}

impl From<&PvConfig> for PvSimulatorConfig {
    fn from(cfg: &PvConfig) -> Self {
        Self {
            power_gen_start: cfg.power_gen_start,
            power_gen_stop: cfg.power_gen_stop,
            peak_hour: cfg.peak_hour,
            max_power_kw: cfg.max_power,
            sigma: cfg.sigma,
            weather_seed: cfg.weather_seed,
        }
    }
}
