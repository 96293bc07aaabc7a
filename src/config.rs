//! Configuration surface (spec §6 "Configuration surface relevant to the
//! core"). Loading follows the teacher's `Config::load` pattern
//! (`src/config.rs`), re-typed for the keys this crate actually reads.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_interval_secs() -> u64 { 2 }
fn default_concurrent() -> usize { 8 }
fn default_smart_tick_interval_secs() -> u64 { 300 }
fn default_discovery_enabled() -> bool { true }
fn default_scan_on_startup() -> bool { true }
fn default_initial_retry_minutes() -> u64 { 1 }
fn default_max_retry_minutes() -> u64 { 60 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_failures() -> u32 { 10 }
fn default_queue_capacity() -> usize { 64 }
fn default_queue_enqueue_wait_secs() -> u64 { 5 }
fn default_command_timeout_secs() -> u64 { 30 }
fn default_max_retries() -> u32 { 3 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// IANA zone used for all timestamps and hour rollover.
    pub timezone: String,
    pub polling: PollingConfig,
    pub discovery: DiscoveryConfig,
    pub queue: QueueConfig,
    pub bus: BusConfig,
    pub smart: SmartConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_concurrent")]
    pub concurrent: usize,
    #[serde(default = "default_smart_tick_interval_secs")]
    pub smart_tick_interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            concurrent: default_concurrent(),
            smart_tick_interval_secs: default_smart_tick_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_enabled")]
    pub enabled: bool,
    #[serde(default = "default_scan_on_startup")]
    pub scan_on_startup: bool,
    pub priority_order: Vec<String>,
    #[serde(default = "default_initial_retry_minutes")]
    pub initial_retry_minutes: u64,
    #[serde(default = "default_max_retry_minutes")]
    pub max_retry_minutes: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default = "default_queue_enqueue_wait_secs")]
    pub enqueue_wait_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            enqueue_wait_secs: default_queue_enqueue_wait_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    pub base_topic: String,
    pub broker_host: String,
    pub broker_port: u16,
    #[serde(default)]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// `smart.policy.*` — all parameters enumerated in spec §4.8. Kept as one
/// flat struct (mirrors the teacher's flat `PlantConfig`) since every field
/// is consumed by `SmartScheduler` at once.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmartConfig {
    pub policy: SchedulerPolicy,
    pub tariffs: Vec<TariffWindow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryMode {
    SelfUse,
    TimeBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    Equal,
    Rated,
    Headroom,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerPolicy {
    pub primary_mode: PrimaryMode,
    pub enable_auto_mode_switching: bool,

    pub overnight_min_soc_pct: u8,
    pub blackout_reserve_soc_pct: u8,
    pub emergency_soc_threshold_grid_available_pct: u8,
    pub emergency_soc_threshold_grid_unavailable_pct: u8,
    pub critical_soc_threshold_grid_available_pct: u8,
    pub critical_soc_threshold_grid_unavailable_pct: u8,
    pub off_grid_startup_soc_pct: u8,

    pub target_full_before_sunset: bool,
    pub max_battery_soc_pct: u8,

    pub max_charge_power_w: u32,
    pub max_discharge_power_w: u32,
    pub max_grid_charge_w: u32,

    pub min_self_sufficiency_pct: u8,
    pub target_self_sufficiency_pct: u8,
    pub max_grid_usage_kwh_per_day: f64,
    pub emergency_reserve_hours: f64,

    pub conserve_on_bad_tomorrow: bool,
    pub bad_sun_threshold_kwh: f64,
    pub poor_weather_threshold_kwh: f64,
    pub solar_target_threshold_pct: u8,
    pub close_to_target_threshold_pct: u8,
    pub load_fallback_kw: f64,

    pub solar_charge_deadline_hours_before_sunset: f64,
    pub pack_nominal_kwh: f64,
    pub split_policy: SplitPolicy,
    pub step_w: u32,
    pub min_w_per_inverter: u32,
    pub reliability_buffer_pct: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TariffKind {
    Cheap,
    Normal,
    Peak,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TariffWindow {
    pub kind: TariffKind,
    /// "HH:MM", may wrap midnight if `end < start`.
    pub start: String,
    pub end: String,
    pub price: f64,
    pub allow_grid_charge: bool,
    pub allow_discharge: bool,
    pub priority: i32,
    pub peak_shaving_enabled: bool,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "timezone": "Europe/Prague",
            "polling": {"interval_secs": 2, "concurrent": 4},
            "discovery": {"priority_order": ["senergy", "bms_active"]},
            "queue": {},
            "bus": {"base_topic": "solarhub", "broker_host": "localhost", "broker_port": 1883},
            "smart": {
                "policy": {
                    "primary_mode": "self_use",
                    "enable_auto_mode_switching": true,
                    "overnight_min_soc_pct": 30,
                    "blackout_reserve_soc_pct": 30,
                    "emergency_soc_threshold_grid_available_pct": 15,
                    "emergency_soc_threshold_grid_unavailable_pct": 25,
                    "critical_soc_threshold_grid_available_pct": 10,
                    "critical_soc_threshold_grid_unavailable_pct": 20,
                    "off_grid_startup_soc_pct": 40,
                    "target_full_before_sunset": true,
                    "max_battery_soc_pct": 100,
                    "max_charge_power_w": 5000,
                    "max_discharge_power_w": 5000,
                    "max_grid_charge_w": 3000,
                    "min_self_sufficiency_pct": 50,
                    "target_self_sufficiency_pct": 80,
                    "max_grid_usage_kwh_per_day": 10.0,
                    "emergency_reserve_hours": 4.0,
                    "conserve_on_bad_tomorrow": true,
                    "bad_sun_threshold_kwh": 5.0,
                    "poor_weather_threshold_kwh": 10.0,
                    "solar_target_threshold_pct": 90,
                    "close_to_target_threshold_pct": 5,
                    "load_fallback_kw": 1.0,
                    "solar_charge_deadline_hours_before_sunset": 1.0,
                    "pack_nominal_kwh": 20.0,
                    "split_policy": "rated",
                    "step_w": 100,
                    "min_w_per_inverter": 200,
                    "reliability_buffer_pct": 5
                },
                "tariffs": []
            }
        }"#
    }

    #[test]
    fn loads_and_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, sample_json()).unwrap();
        let cfg = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.timezone, "Europe/Prague");
        assert_eq!(cfg.queue.capacity, 64);
        assert_eq!(cfg.discovery.max_retry_minutes, 60);
        assert_eq!(cfg.smart.policy.split_policy, SplitPolicy::Rated);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Config::load("/nonexistent/path/config.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
