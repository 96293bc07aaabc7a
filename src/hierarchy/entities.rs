//! Hierarchy entities (spec §3). Created by configuration loading (out of
//! scope for this crate — only the in-memory shape is specified), mutated
//! only through explicit management operations, destruction rare. Grounded
//! on `solarhub/hierarchy/{base,arrays,batteries,system}.py`.
//!
//! `Serialize`/`Deserialize` are derived the same way `config.rs` derives
//! them on `Config`: the shape is what spec §3 names, loading mechanics
//! are `hierarchy::load`'s concern (SPEC_FULL.md §A).

use serde::{Deserialize, Serialize};

use super::devices::{AdapterInstance, Attachment};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct System {
    pub system_id: String,
    pub name: String,
    /// One timezone per system (spec §3).
    pub timezone: String,
    pub inverter_arrays: Vec<String>,
    pub battery_arrays: Vec<String>,
    pub meters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InverterArray {
    pub array_id: String,
    pub system_id: String,
    pub name: String,
    /// Ordered set of owned inverters.
    pub inverters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryArray {
    pub array_id: String,
    pub system_id: String,
    pub name: String,
    /// Ordered set of owned packs.
    pub packs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inverter {
    pub inverter_id: String,
    pub array_id: String,
    pub system_id: String,
    pub adapter_type: String,
    pub rated_power_w: u32,
    /// Opaque adapter configuration blob, same shape as `AdapterInstance::config`
    /// (serial port, unit id, register map path, etc.) — an inverter owns
    /// exactly one transport binding, unlike a `BatteryPack`'s ranked list.
    pub adapter_config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryPack {
    pub pack_id: String,
    pub array_id: String,
    pub system_id: String,
    /// 1..N battery units.
    pub batteries: Vec<String>,
    pub adapters: Vec<AdapterInstance>,
    pub max_charge_kw: f64,
    pub max_discharge_kw: f64,
}

impl BatteryPack {
    /// Spec §3 invariant: "A `BatteryPack` has at least one enabled
    /// adapter; the primary adapter is the lowest-priority-number enabled
    /// adapter."
    pub fn primary_adapter(&self) -> Option<&AdapterInstance> {
        AdapterInstance::primary(&self.adapters)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Battery {
    pub battery_id: String,
    pub pack_id: String,
    pub system_id: String,
    /// Typically 16 cells.
    pub cells: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryCell {
    pub cell_id: String,
    pub battery_id: String,
    pub system_id: String,
    pub index: u8,
}

/// Belongs to a `System`, optionally attached to an `InverterArray`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meter {
    pub meter_id: String,
    pub system_id: String,
    pub array_id: Option<String>,
    /// Opaque adapter configuration blob, same convention as `Inverter::adapter_config`.
    pub adapter_config: serde_json::Value,
}

/// The complete in-memory hierarchy for one system plus the attachment
/// index used to resolve `BatteryArray <-> InverterArray` links without a
/// direct pointer in both directions (spec §9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hierarchy {
    pub systems: Vec<System>,
    pub inverter_arrays: Vec<InverterArray>,
    pub battery_arrays: Vec<BatteryArray>,
    pub inverters: Vec<Inverter>,
    pub packs: Vec<BatteryPack>,
    pub batteries: Vec<Battery>,
    pub cells: Vec<BatteryCell>,
    pub meters: Vec<Meter>,
    pub attachments: Vec<Attachment>,
}

impl Hierarchy {
    /// The currently-active attachment for a battery array, if any.
    pub fn active_attachment_for_battery_array(&self, battery_array_id: &str) -> Option<&Attachment> {
        self.attachments
            .iter()
            .find(|a| a.battery_array_id == battery_array_id && a.is_active())
    }

    /// The currently-active attachment for an inverter array, if any.
    pub fn active_attachment_for_inverter_array(&self, inverter_array_id: &str) -> Option<&Attachment> {
        self.attachments
            .iter()
            .find(|a| a.inverter_array_id == inverter_array_id && a.is_active())
    }
}
