//! Attachment records and per-pack adapter ranking. Grounded on
//! `solarhub/hierarchy/adapters.py` and `solarhub/hierarchy/arrays.py`
//! (the 1:1 battery-array/inverter-array link).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Time-bounded 1:1 link between a `BatteryArray` and an `InverterArray`
/// (spec §3: "weak-references at most one ... (1:1 attachment,
/// time-bounded with `attached_since`/`detached_at`)"). Resolved through an
/// indexed lookup rather than a direct pointer in both directions, per
/// spec §9 ("Hierarchy graph").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub battery_array_id: String,
    pub inverter_array_id: String,
    pub attached_since: DateTime<Utc>,
    pub detached_at: Option<DateTime<Utc>>,
}

impl Attachment {
    pub fn new(battery_array_id: impl Into<String>, inverter_array_id: impl Into<String>) -> Self {
        Self {
            battery_array_id: battery_array_id.into(),
            inverter_array_id: inverter_array_id.into(),
            attached_since: Utc::now(),
            detached_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.detached_at.is_none()
    }

    pub fn detach(&mut self) {
        self.detached_at = Some(Utc::now());
    }
}

/// One physical transport binding owned by a `BatteryPack`, ranked by
/// priority for failover (spec §3: "A pack may own multiple
/// `AdapterInstance`s ranked by priority for failover").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterInstance {
    pub adapter_type: String,
    pub priority: u32,
    pub enabled: bool,
    /// Opaque adapter configuration blob (register map path, serial port,
    /// BLE MAC, etc.) — the concrete shape is adapter-variant-specific and
    /// lives in `adapters::AdapterConfig`.
    pub config: serde_json::Value,
}

impl AdapterInstance {
    /// The primary adapter is the lowest-priority-number enabled adapter
    /// (spec §3 invariant).
    pub fn primary<'a>(instances: &'a [AdapterInstance]) -> Option<&'a AdapterInstance> {
        instances
            .iter()
            .filter(|a| a.enabled)
            .min_by_key(|a| a.priority)
    }
}
