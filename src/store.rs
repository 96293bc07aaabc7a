//! Persistent telemetry store (spec §6 "TelemetryStore"). Interface only —
//! the spec treats persistence as out of scope for the core, naming just
//! the operations the Orchestrator and energy accumulator call. Grounded
//! on the teacher's `shared_state.rs` for the shape of what gets stored,
//! generalized from an in-memory `AppState` to a trait so a real backend
//! can be swapped in without touching the core.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

use crate::energy::HourlyEnergyRow;
use crate::registry::DeviceEntry;
use crate::telemetry::{BatteryBankTelemetry, BatteryCellRecord, BatteryUnitRecord, InverterTelemetry, MeterTelemetry};

/// Where a stored config value came from, carried alongside the value so
/// operators can tell a user override from a shipped default (SPEC_FULL.md
/// §C "config provenance").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Default,
    File,
    Operator,
}

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn insert_sample(&self, inverter_id: &str, tel: &InverterTelemetry) -> Result<(), StoreError>;
    async fn insert_battery_bank_sample(&self, bank_id: &str, tel: &BatteryBankTelemetry) -> Result<(), StoreError>;
    async fn insert_battery_unit_samples(&self, bank_id: &str, units: &[BatteryUnitRecord]) -> Result<(), StoreError>;
    async fn insert_battery_cell_samples(&self, bank_id: &str, unit: usize, cells: &[BatteryCellRecord]) -> Result<(), StoreError>;
    async fn insert_meter_sample(&self, meter_id: &str, tel: &MeterTelemetry) -> Result<(), StoreError>;
    async fn upsert_meter_daily(&self, meter_id: &str, date: NaiveDate, import_wh: f64, export_wh: f64) -> Result<(), StoreError>;
    async fn upsert_daily_pv(&self, date: NaiveDate, inverter_id: &str, kwh: f64) -> Result<(), StoreError>;
    async fn upsert_hourly_energy(&self, row: &HourlyEnergyRow) -> Result<(), StoreError>;
    async fn get_config(&self, key: &str) -> Result<Option<(Value, ConfigSource)>, StoreError>;
    async fn set_config(&self, key: &str, value: Value, source: ConfigSource) -> Result<(), StoreError>;
    /// Full registry snapshot (spec §6 "`get_all_devices()` (via
    /// registry)"), unfiltered by status. The filtered read query
    /// (SPEC_FULL.md §C "devices_needing_attention") lives directly on
    /// `DeviceRegistry::devices_needing_attention`, not here — this method
    /// only mirrors the registry into whatever backs the store.
    async fn get_all_devices(&self) -> Result<Vec<DeviceEntry>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}
