#![allow(dead_code)]
//! Process configuration: `HilConfig` nested config tree, loaded via
//! `figment` TOML+env layering and validated with `validator`.
//!
//! Grounded in the teacher's `config.rs`: nested `#[derive(Deserialize,
//! Serialize, Validate)]` structs, `fn default_*()` serde default
//! providers, a `load()`/`load_with_env()` pair.

use std::collections::HashMap;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::domain::{ByteOrder, PointSpec, WordOrder};

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct HilConfig {
    #[serde(default = "default_timezone")]
    #[validate(length(min = 1))]
    pub timezone: String,

    #[validate(nested)]
    pub timing: TimingConfig,

    #[validate(nested)]
    pub schedule: ScheduleConfig,

    #[validate(nested)]
    pub api: ApiConfig,

    #[validate(nested)]
    pub recording: RecordingConfig,

    #[validate(nested)]
    pub plants: PlantsConfig,

    #[validate(nested)]
    pub startup: StartupConfig,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

/// Loop periods for every agent (§5).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TimingConfig {
    #[serde(default = "default_scheduler_period_s")]
    #[validate(range(min = 0.05))]
    pub scheduler_period_s: f64,

    #[serde(default = "default_plant_period_s")]
    #[validate(range(min = 0.05))]
    pub plant_period_s: f64,

    #[serde(default = "default_measurement_period_s")]
    #[validate(range(min = 0.05))]
    pub measurement_period_s: f64,

    #[serde(default = "default_measurements_write_period_s")]
    #[validate(range(min = 1.0))]
    pub measurements_write_period_s: f64,

    #[serde(default = "default_data_fetcher_period_s")]
    #[validate(range(min = 1.0))]
    pub data_fetcher_period_s: f64,

    #[serde(default = "default_control_engine_period_s")]
    #[validate(range(min = 0.05))]
    pub control_engine_period_s: f64,

    #[serde(default = "default_settings_engine_period_s")]
    #[validate(range(min = 0.02))]
    pub settings_engine_period_s: f64,
}

fn default_timezone() -> String { crate::time_utils::DEFAULT_TIMEZONE_NAME.to_string() }

fn default_scheduler_period_s() -> f64 { 1.0 }
fn default_plant_period_s() -> f64 { 1.0 }
fn default_measurement_period_s() -> f64 { 1.0 }
fn default_measurements_write_period_s() -> f64 { 60.0 }
fn default_data_fetcher_period_s() -> f64 { 60.0 }
fn default_control_engine_period_s() -> f64 { 1.0 }
fn default_settings_engine_period_s() -> f64 { 0.2 }

/// Day-ahead schedule resolution.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ScheduleConfig {
    #[serde(default = "default_duration_h")]
    #[validate(range(min = 1))]
    pub duration_h: u32,

    #[serde(default = "default_resolution_min")]
    #[validate(range(min = 1))]
    pub default_resolution_min: u32,

    #[serde(default = "default_schedule_source")]
    pub startup_schedule_source: String,
}

fn default_duration_h() -> u32 { 24 }
fn default_resolution_min() -> u32 { 15 }
fn default_schedule_source() -> String { "manual".to_string() }

/// Day-ahead market API client configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ApiConfig {
    #[validate(length(min = 1))]
    pub base_url: String,

    #[validate(length(min = 1))]
    pub email: String,

    #[serde(default = "default_tomorrow_poll_start_time")]
    #[validate(custom(function = "validate_time_of_day"))]
    pub tomorrow_poll_start_time: String,

    #[serde(default = "default_schedule_period_minutes")]
    #[validate(range(min = 1))]
    pub schedule_period_minutes: u32,

    #[serde(default = "default_post_measurements_in_api_mode")]
    pub post_measurements_in_api_mode: bool,

    #[validate(nested)]
    #[serde(default)]
    pub post: MeasurementPostConfig,
}

fn default_tomorrow_poll_start_time() -> String { "14:00".to_string() }
fn default_schedule_period_minutes() -> u32 { 15 }
fn default_post_measurements_in_api_mode() -> bool { true }

/// Accepts `HH:MM` in 24-hour time, e.g. `"14:00"`.
fn validate_time_of_day(value: &str) -> Result<(), ValidationError> {
    let invalid = || {
        let mut err = ValidationError::new("invalid_time_of_day");
        err.message = Some("expected HH:MM in 24-hour time".into());
        err
    };
    let (h, m) = value.split_once(':').ok_or_else(invalid)?;
    if h.len() != 2 || m.len() != 2 {
        return Err(invalid());
    }
    let h: u32 = h.parse().map_err(|_| invalid())?;
    let m: u32 = m.parse().map_err(|_| invalid())?;
    if h > 23 || m > 59 {
        return Err(invalid());
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct MeasurementPostConfig {
    #[serde(default = "default_measurement_post_period_s")]
    #[validate(range(min = 0.1))]
    pub period_s: f64,

    #[serde(default = "default_queue_maxlen")]
    #[validate(range(min = 1))]
    pub queue_maxlen: usize,

    #[serde(default = "default_retry_initial_s")]
    #[validate(range(min = 0.1))]
    pub retry_initial_s: f64,

    #[serde(default = "default_retry_max_s")]
    #[validate(range(min = 1.0))]
    pub retry_max_s: f64,
}

impl Default for MeasurementPostConfig {
    fn default() -> Self {
        Self {
            period_s: default_measurement_post_period_s(),
            queue_maxlen: default_queue_maxlen(),
            retry_initial_s: default_retry_initial_s(),
            retry_max_s: default_retry_max_s(),
        }
    }
}

fn default_measurement_post_period_s() -> f64 { 1.0 }
fn default_queue_maxlen() -> usize { 2000 }
fn default_retry_initial_s() -> f64 { 2.0 }
fn default_retry_max_s() -> f64 { 60.0 }

/// Recording and compression policy.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct RecordingConfig {
    #[serde(default = "default_true")]
    pub compression_enabled: bool,

    #[serde(default = "default_max_kept_gap_s")]
    #[validate(range(min = 1))]
    pub max_kept_gap_s: i64,

    #[validate(nested)]
    #[serde(default)]
    pub tolerances: RecordingTolerancesConfig,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_true() -> bool { true }
fn default_max_kept_gap_s() -> i64 { 3600 }
fn default_data_dir() -> String { "data".to_string() }

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct RecordingTolerancesConfig {
    #[serde(default)]
    pub p_setpoint_kw: f64,
    #[serde(default)]
    pub battery_active_power_kw: f64,
    #[serde(default)]
    pub q_setpoint_kvar: f64,
    #[serde(default)]
    pub battery_reactive_power_kvar: f64,
    #[serde(default)]
    pub soc_pu: f64,
    #[serde(default)]
    pub p_poi_kw: f64,
    #[serde(default)]
    pub q_poi_kvar: f64,
    #[serde(default)]
    pub v_poi_kv: f64,
}

/// Both plants' static config.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PlantsConfig {
    #[validate(nested)]
    pub lib: PlantConfig,
    #[validate(nested)]
    pub vrfb: PlantConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PlantConfig {
    #[validate(length(min = 1))]
    pub name: String,

    #[validate(nested)]
    pub model: PlantModelConfig,

    #[validate(nested)]
    pub modbus: PlantModbusConfig,

    #[validate(nested)]
    pub measurement_series: MeasurementSeriesConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Validate)]
pub struct PlantModelConfig {
    #[validate(range(min = 0.0))]
    pub capacity_kwh: f64,
    pub p_max_kw: f64,
    pub p_min_kw: f64,
    pub q_max_kvar: f64,
    pub q_min_kvar: f64,
    #[validate(range(min = 0.0))]
    pub poi_voltage_kv: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PlantModbusConfig {
    #[validate(nested)]
    pub local: ModbusEndpointConfig,
    #[validate(nested)]
    pub remote: Option<ModbusEndpointConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ModbusEndpointConfig {
    #[validate(length(min = 1))]
    pub host: String,
    pub port: u16,
    pub byte_order: ByteOrder,
    pub word_order: WordOrder,
    #[validate(custom(function = "validate_required_points"))]
    pub points: HashMap<String, PointSpec>,
}

fn validate_required_points(points: &HashMap<String, PointSpec>) -> Result<(), ValidationError> {
    for name in crate::domain::modbus_point::REQUIRED_POINT_NAMES {
        if !points.contains_key(name) {
            let mut err = ValidationError::new("missing_required_point");
            err.message = Some(format!("missing required point '{name}'").into());
            return Err(err);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct MeasurementSeriesConfig {
    pub soc: i64,
    pub p: i64,
    pub q: i64,
    pub v: i64,
}

impl From<&MeasurementSeriesConfig> for crate::domain::measurement::PostSeriesIds {
    fn from(cfg: &MeasurementSeriesConfig) -> Self {
        Self {
            soc: Some(cfg.soc.to_string()),
            p: Some(cfg.p.to_string()),
            q: Some(cfg.q.to_string()),
            v: Some(cfg.v.to_string()),
        }
    }
}

impl From<&PlantModelConfig> for crate::domain::PlantModel {
    fn from(cfg: &PlantModelConfig) -> Self {
        Self {
            capacity_kwh: cfg.capacity_kwh,
            p_max_kw: cfg.p_max_kw,
            p_min_kw: cfg.p_min_kw,
            q_max_kvar: cfg.q_max_kvar,
            q_min_kvar: cfg.q_min_kvar,
            poi_voltage_kv: cfg.poi_voltage_kv,
        }
    }
}

impl From<&ModbusEndpointConfig> for crate::modbus::ModbusEndpoint {
    fn from(cfg: &ModbusEndpointConfig) -> Self {
        Self {
            host: cfg.host.clone(),
            port: cfg.port,
            byte_order: cfg.byte_order,
            word_order: cfg.word_order,
            points: cfg.points.clone(),
        }
    }
}

/// Process startup defaults.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct StartupConfig {
    #[serde(default = "default_transport_mode")]
    pub transport_mode: String,

    #[serde(default = "default_initial_soc_pu")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub initial_soc_pu: f64,
}

fn default_transport_mode() -> String { "local".to_string() }
fn default_initial_soc_pu() -> f64 { 0.5 }

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_log_level() -> String { "info".to_string() }
fn default_log_dir() -> String { "logs".to_string() }

impl HilConfig {
    /// Load configuration from TOML files and environment variables.
    ///
    /// Layering order (later overrides earlier):
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml`
    /// 3. Environment variables with `HIL__` prefix
    pub fn load() -> Result<Self> {
        Self::load_with_env(None)
    }

    pub fn load_with_env(environment: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config/default.toml"));

        if let Some(env) = environment {
            figment = figment.merge(Toml::file(format!("config/{env}.toml")));
        }

        figment = figment.merge(Env::prefixed("HIL__").split("__"));

        let config: HilConfig = figment.extract().context("failed to parse configuration")?;
        config.validate().context("configuration validation failed")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(address: u16) -> PointSpec {
        use crate::domain::{PointAccess, RegisterFormat};
        PointSpec { address, format: RegisterFormat::Int32, access: PointAccess::Rw, unit: "kW".to_string(), eng_per_count: 0.1 }
    }

    fn required_points() -> HashMap<String, PointSpec> {
        let mut points = HashMap::new();
        for (i, name) in crate::domain::modbus_point::REQUIRED_POINT_NAMES.iter().enumerate() {
            points.insert(name.to_string(), point(i as u16 * 2));
        }
        points
    }

    fn endpoint() -> ModbusEndpointConfig {
        ModbusEndpointConfig { host: "localhost".to_string(), port: 5020, byte_order: ByteOrder::Big, word_order: WordOrder::MswFirst, points: required_points() }
    }

    fn plant_model() -> PlantModelConfig {
        PlantModelConfig { capacity_kwh: 100.0, p_max_kw: 50.0, p_min_kw: -50.0, q_max_kvar: 20.0, q_min_kvar: -20.0, poi_voltage_kv: 11.0 }
    }

    fn plant_config(name: &str) -> PlantConfig {
        PlantConfig {
            name: name.to_string(),
            model: plant_model(),
            modbus: PlantModbusConfig { local: endpoint(), remote: None },
            measurement_series: MeasurementSeriesConfig { soc: 4, p: 6, q: 7, v: 8 },
        }
    }

    #[test]
    fn missing_required_point_fails_validation() {
        let mut points = required_points();
        points.remove("v_poi");
        let cfg = ModbusEndpointConfig { points, ..endpoint() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn complete_point_map_passes_validation() {
        assert!(endpoint().validate().is_ok());
    }

    #[test]
    fn tomorrow_poll_start_time_must_be_hh_mm() {
        let api = ApiConfig {
            base_url: "https://example.test".to_string(),
            email: "ops@example.test".to_string(),
            tomorrow_poll_start_time: "not-a-time".to_string(),
            schedule_period_minutes: default_schedule_period_minutes(),
            post_measurements_in_api_mode: true,
            post: MeasurementPostConfig::default(),
        };
        assert!(api.validate().is_err());
    }

    #[test]
    fn plant_model_rejects_negative_capacity() {
        let mut model = plant_model();
        model.capacity_kwh = -1.0;
        assert!(model.validate().is_err());
    }

    #[test]
    fn full_plant_config_passes_validation() {
        assert!(plant_config("Lib Plant").validate().is_ok());
    }
}
