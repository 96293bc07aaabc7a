//! Core value types (spec §3 "Core value types") and the in-memory
//! `TelemetryManager` ring buffer. Doc-comment density/grouping style
//! follows the teacher's `src/models/power.rs`.

use std::collections::{HashMap, VecDeque};

use chrono::DateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum samples kept per entity in the in-memory ring (spec §3
/// "Lifecycle": "a small ring (≤100 per entity) is kept in memory").
pub const TELEMETRY_RING_CAPACITY: usize = 100;

/// Inverter telemetry normalized from any Modbus-backed adapter variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InverterTelemetry {
    /// Configured-timezone local time, ISO-8601, set by the adapter at poll time.
    pub ts: DateTime<Tz>,
    pub array_id: String,
    pub pv_power_w: f64,
    pub load_power_w: f64,
    /// Signed: positive = import from grid.
    pub grid_power_w: f64,
    /// Signed: positive = charging, negative = discharging.
    pub batt_power_w: f64,
    pub batt_soc_pct: u8,
    pub batt_voltage_v: f64,
    pub batt_current_a: f64,
    pub inverter_temp_c: f64,
    pub inverter_mode: String,
    /// Device-specific fields carried through unchanged.
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

/// Per-unit (battery) record within a `BatteryBankTelemetry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryUnitRecord {
    pub voltage_v: f64,
    pub current_a: f64,
    pub soc_pct: u8,
    pub soh_pct: u8,
    pub temperature_c: f64,
    pub cycles: u32,
    pub status_flags: u32,
}

/// Per-cell record, optional — only populated by adapters that decode
/// cell-level data (BMS-Passive/TCP/BLE, spec §4.1 items 4-6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryCellRecord {
    pub voltage_v: f64,
    pub resistance_mohm: f64,
    pub balancing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryBankTelemetry {
    pub bank_id: String,
    pub ts: DateTime<Tz>,
    pub voltage_v: f64,
    pub current_a: f64,
    pub temperature_c: f64,
    pub soc_pct: u8,
    pub batteries_count: u8,
    pub cells_per_battery: u8,
    pub units: Vec<BatteryUnitRecord>,
    pub cells: Option<Vec<Vec<BatteryCellRecord>>>,
}

/// Grid-side meter telemetry. Daily counters reset at local midnight
/// (spec §3); resetting is performed by the caller (`energy.rs`), not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterTelemetry {
    pub meter_id: String,
    pub ts: DateTime<Tz>,
    pub voltage_v: f64,
    pub current_a: f64,
    /// Signed: positive = import.
    pub power_w: f64,
    pub frequency_hz: f64,
    pub power_factor: f64,
    pub cumulative_import_wh: f64,
    pub cumulative_export_wh: f64,
    pub daily_import_wh: f64,
    pub daily_export_wh: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayTelemetry {
    pub array_id: String,
    pub ts: DateTime<Tz>,
    pub pv_power_w: f64,
    pub load_power_w: f64,
    pub grid_power_w: f64,
    pub batt_power_w: f64,
    pub batt_soc_pct: u8,
    pub batt_voltage_v: f64,
    pub max_charge_kw: f64,
    pub max_discharge_kw: f64,
    pub member_ids: Vec<String>,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemTelemetry {
    pub system_id: String,
    pub ts: DateTime<Tz>,
    pub pv_power_w: f64,
    pub load_power_w: f64,
    pub grid_power_w: f64,
    pub batt_power_w: f64,
    pub net_import_wh: f64,
    pub net_export_wh: f64,
    pub member_ids: Vec<String>,
}

/// A single in-memory ring of the most recent samples for one entity.
#[derive(Debug, Default)]
pub struct Ring<T> {
    samples: VecDeque<T>,
}

impl<T> Ring<T> {
    pub fn push(&mut self, sample: T) {
        if self.samples.len() == TELEMETRY_RING_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<&T> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Holds the bounded in-memory rings for every entity kind, keyed by id.
/// The polling loop is the sole writer (spec §9); readers copy out on
/// demand via `latest_*`.
#[derive(Debug, Default)]
pub struct TelemetryManager {
    inverters: HashMap<String, Ring<InverterTelemetry>>,
    banks: HashMap<String, Ring<BatteryBankTelemetry>>,
    meters: HashMap<String, Ring<MeterTelemetry>>,
    arrays: HashMap<String, Ring<ArrayTelemetry>>,
    systems: HashMap<String, Ring<SystemTelemetry>>,
}

impl TelemetryManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_inverter(&mut self, inverter_id: &str, sample: InverterTelemetry) {
        self.inverters.entry(inverter_id.to_string()).or_default().push(sample);
    }

    pub fn record_bank(&mut self, bank_id: &str, sample: BatteryBankTelemetry) {
        self.banks.entry(bank_id.to_string()).or_default().push(sample);
    }

    pub fn record_meter(&mut self, meter_id: &str, sample: MeterTelemetry) {
        self.meters.entry(meter_id.to_string()).or_default().push(sample);
    }

    pub fn record_array(&mut self, array_id: &str, sample: ArrayTelemetry) {
        self.arrays.entry(array_id.to_string()).or_default().push(sample);
    }

    pub fn record_system(&mut self, system_id: &str, sample: SystemTelemetry) {
        self.systems.entry(system_id.to_string()).or_default().push(sample);
    }

    pub fn latest_inverter(&self, inverter_id: &str) -> Option<&InverterTelemetry> {
        self.inverters.get(inverter_id).and_then(Ring::latest)
    }

    pub fn latest_bank(&self, bank_id: &str) -> Option<&BatteryBankTelemetry> {
        self.banks.get(bank_id).and_then(Ring::latest)
    }

    pub fn latest_meter(&self, meter_id: &str) -> Option<&MeterTelemetry> {
        self.meters.get(meter_id).and_then(Ring::latest)
    }

    pub fn latest_array(&self, array_id: &str) -> Option<&ArrayTelemetry> {
        self.arrays.get(array_id).and_then(Ring::latest)
    }

    pub fn latest_system(&self, system_id: &str) -> Option<&SystemTelemetry> {
        self.systems.get(system_id).and_then(Ring::latest)
    }

    pub fn inverter_ring(&self, inverter_id: &str) -> Option<&Ring<InverterTelemetry>> {
        self.inverters.get(inverter_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(i: u8) -> InverterTelemetry {
        InverterTelemetry {
            ts: chrono::Utc::now().with_timezone(&Tz::UTC),
            array_id: "arr1".into(),
            pv_power_w: i as f64,
            load_power_w: 0.0,
            grid_power_w: 0.0,
            batt_power_w: 0.0,
            batt_soc_pct: 50,
            batt_voltage_v: 48.0,
            batt_current_a: 0.0,
            inverter_temp_c: 30.0,
            inverter_mode: "normal".into(),
            extra: HashMap::new(),
        }
    }

    #[test]
    fn ring_caps_at_capacity() {
        let mut mgr = TelemetryManager::new();
        for i in 0..(TELEMETRY_RING_CAPACITY as u16 + 10) {
            mgr.record_inverter("inv1", sample((i % 255) as u8));
        }
        let ring = mgr.inverter_ring("inv1").unwrap();
        assert_eq!(ring.len(), TELEMETRY_RING_CAPACITY);
    }

    #[test]
    fn latest_reflects_last_write() {
        let mut mgr = TelemetryManager::new();
        mgr.record_inverter("inv1", sample(1));
        mgr.record_inverter("inv1", sample(2));
        assert_eq!(mgr.latest_inverter("inv1").unwrap().pv_power_w, 2.0);
    }
}
