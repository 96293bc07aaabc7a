//! `DeviceRegistry` (spec §4.2). Grounded on `solarhub/device_registry.py`.
//! Spec §1 names only the SQL `TelemetryStore` as out of scope; the
//! registry itself is a "Persistent table" (spec §3) — a device that hits
//! `max_failures` must stay `permanently_disabled` across restarts (spec
//! §7) — so this crate gives it its own JSON file, loaded/saved the same
//! way `Config::load`/`hierarchy::load` round-trip theirs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Active,
    Recovering,
    PermanentlyDisabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub device_type: String,
    pub serial_number: String,
    pub port: Option<String>,
    pub last_known_port: Option<String>,
    /// Ordered, deduplicated.
    pub port_history: Vec<String>,
    pub adapter_config: Value,
    pub status: DeviceStatus,
    pub failure_count: u32,
    pub next_retry_time: Option<DateTime<Utc>>,
    pub first_discovered: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub discovery_timestamp: DateTime<Utc>,
    pub is_auto_discovered: bool,
}

/// Normalize a serial number: uppercase, alphanumeric only, left-padded to
/// 6 chars if shorter (spec §3 "Normalized serial").
pub fn normalize_serial(serial: &str) -> String {
    let upper: String = serial.chars().filter(|c| c.is_alphanumeric()).map(|c| c.to_ascii_uppercase()).collect();
    if upper.len() < 6 {
        format!("{:0>6}", upper)
    } else {
        upper
    }
}

/// `{type}_{last6_of_normalized_serial}` (spec §3 "Identifiers").
pub fn device_id_for(device_type: &str, serial: &str) -> String {
    let normalized = normalize_serial(serial);
    let last6 = &normalized[normalized.len().saturating_sub(6)..];
    format!("{device_type}_{last6}")
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DeviceRegistry {
    devices: HashMap<String, DeviceEntry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the registry file, starting empty if it doesn't exist yet
    /// (first run) rather than treating that as an error.
    pub fn load(path: &str) -> Result<Self, RegistryError> {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).map_err(|source| RegistryError::Parse { path: path.to_string(), source }),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(RegistryError::Io { path: path.to_string(), source }),
        }
    }

    /// Persists the registry so `status`/`failure_count`/`port_history`
    /// survive a process restart (spec §7 "stays there across restarts
    /// until `re_enable` is called").
    pub fn save(&self, path: &str) -> Result<(), RegistryError> {
        let content = serde_json::to_string_pretty(self).map_err(RegistryError::Serialize)?;
        std::fs::write(path, content).map_err(|source| RegistryError::Io { path: path.to_string(), source })
    }

    pub fn lookup(&self, serial: &str, device_type: &str) -> Option<&DeviceEntry> {
        let normalized = normalize_serial(serial);
        self.devices
            .values()
            .find(|d| d.serial_number == normalized && d.device_type == device_type)
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceEntry> {
        self.devices.get(device_id)
    }

    pub fn get_all(&self) -> Vec<&DeviceEntry> {
        let mut v: Vec<&DeviceEntry> = self.devices.values().collect();
        v.sort_by(|a, b| (&a.device_type, &a.device_id).cmp(&(&b.device_type, &b.device_id)));
        v
    }

    pub fn list_by_status(&self, status: DeviceStatus) -> Vec<&DeviceEntry> {
        let mut v: Vec<&DeviceEntry> = self.devices.values().filter(|d| d.status == status).collect();
        v.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        v
    }

    /// Anything not `active` (SPEC_FULL.md §C "devices_needing_attention"):
    /// recovering with a pending retry, or permanently disabled — the read
    /// query `check_battery_logging.py`/`check_meter_attachments.py` were
    /// built on, without the script execution surface around it.
    pub fn devices_needing_attention(&self) -> Vec<&DeviceEntry> {
        let mut v: Vec<&DeviceEntry> = self.devices.values().filter(|d| d.status != DeviceStatus::Active).collect();
        v.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        v
    }

    /// Register a brand-new device discovered on `port` (spec §4.3 phase 3).
    pub fn register_new(&mut self, device_type: &str, serial: &str, port: String, adapter_config: Value) -> &DeviceEntry {
        let normalized = normalize_serial(serial);
        let device_id = device_id_for(device_type, serial);
        let now = Utc::now();
        let entry = DeviceEntry {
            device_id: device_id.clone(),
            device_type: device_type.to_string(),
            serial_number: normalized,
            port: Some(port.clone()),
            last_known_port: Some(port.clone()),
            port_history: vec![port],
            adapter_config,
            status: DeviceStatus::Active,
            failure_count: 0,
            next_retry_time: None,
            first_discovered: now,
            last_seen: Some(now),
            discovery_timestamp: now,
            is_auto_discovered: true,
        };
        self.devices.insert(device_id.clone(), entry);
        self.devices.get(&device_id).unwrap()
    }

    /// Update the port for an existing device, appending the previous port
    /// into history when it changes (spec §4.2 "update port").
    pub fn update_port(&mut self, device_id: &str, new_port: String) {
        if let Some(entry) = self.devices.get_mut(device_id) {
            let changed = entry.port.as_deref() != Some(new_port.as_str());
            if changed {
                if let Some(old) = entry.port.take() {
                    if !entry.port_history.contains(&old) {
                        entry.port_history.push(old);
                    }
                }
            }
            entry.port = Some(new_port.clone());
            entry.last_known_port = Some(new_port);
            entry.last_seen = Some(Utc::now());
        }
    }

    pub fn mark_seen(&mut self, device_id: &str) {
        if let Some(entry) = self.devices.get_mut(device_id) {
            entry.last_seen = Some(Utc::now());
        }
    }

    /// Increments `failure_count`, sets status=recovering, sets
    /// `next_retry_time` (spec §4.2 "mark failed").
    pub fn mark_failed(&mut self, device_id: &str, next_retry_time: DateTime<Utc>) {
        if let Some(entry) = self.devices.get_mut(device_id) {
            entry.failure_count += 1;
            entry.status = DeviceStatus::Recovering;
            entry.next_retry_time = Some(next_retry_time);
        }
    }

    /// status=active, failure_count=0 (spec §4.2 "mark recovered").
    pub fn mark_recovered(&mut self, device_id: &str) {
        if let Some(entry) = self.devices.get_mut(device_id) {
            entry.status = DeviceStatus::Active;
            entry.failure_count = 0;
            entry.next_retry_time = None;
            entry.last_seen = Some(Utc::now());
        }
    }

    pub fn permanently_disable(&mut self, device_id: &str) {
        if let Some(entry) = self.devices.get_mut(device_id) {
            entry.status = DeviceStatus::PermanentlyDisabled;
        }
    }

    /// status=recovering, immediate retry (spec §4.2 "re-enable").
    pub fn re_enable(&mut self, device_id: &str) {
        if let Some(entry) = self.devices.get_mut(device_id) {
            entry.status = DeviceStatus::Recovering;
            entry.next_retry_time = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_and_pads_short_serials() {
        assert_eq!(normalize_serial("ab-12"), "00AB12");
        assert_eq!(normalize_serial("sn-1234567890"), "SN1234567890");
    }

    #[test]
    fn device_id_takes_last_six_of_normalized() {
        assert_eq!(device_id_for("senergy", "SN-1234567890"), "senergy_567890");
        assert_eq!(device_id_for("bms_active", "BMS-ABC001"), "bms_active_abc001");
    }

    #[test]
    fn update_port_appends_old_to_history() {
        let mut reg = DeviceRegistry::new();
        reg.register_new("senergy", "SN-1234567890", "/dev/ttyUSB0".into(), serde_json::json!({}));
        let id = device_id_for("senergy", "SN-1234567890");
        reg.update_port(&id, "/dev/ttyUSB2".into());
        let entry = reg.get(&id).unwrap();
        assert_eq!(entry.port.as_deref(), Some("/dev/ttyUSB2"));
        assert_eq!(entry.port_history, vec!["/dev/ttyUSB0".to_string()]);
    }

    #[test]
    fn mark_failed_then_recovered_resets_count() {
        let mut reg = DeviceRegistry::new();
        reg.register_new("senergy", "SN-1234567890", "/dev/ttyUSB0".into(), serde_json::json!({}));
        let id = device_id_for("senergy", "SN-1234567890");
        reg.mark_failed(&id, Utc::now());
        assert_eq!(reg.get(&id).unwrap().status, DeviceStatus::Recovering);
        assert_eq!(reg.get(&id).unwrap().failure_count, 1);
        reg.mark_recovered(&id);
        assert_eq!(reg.get(&id).unwrap().status, DeviceStatus::Active);
        assert_eq!(reg.get(&id).unwrap().failure_count, 0);
    }

    #[test]
    fn permanently_disabled_persists_until_re_enable() {
        let mut reg = DeviceRegistry::new();
        reg.register_new("senergy", "SN-1234567890", "/dev/ttyUSB0".into(), serde_json::json!({}));
        let id = device_id_for("senergy", "SN-1234567890");
        reg.permanently_disable(&id);
        assert_eq!(reg.get(&id).unwrap().status, DeviceStatus::PermanentlyDisabled);
        reg.re_enable(&id);
        assert_eq!(reg.get(&id).unwrap().status, DeviceStatus::Recovering);
    }

    #[test]
    fn devices_needing_attention_excludes_active() {
        let mut reg = DeviceRegistry::new();
        reg.register_new("senergy", "SN-1234567890", "/dev/ttyUSB0".into(), serde_json::json!({}));
        reg.register_new("bms_active", "BMS-ABC001", "/dev/ttyUSB1".into(), serde_json::json!({}));
        let recovering_id = device_id_for("senergy", "SN-1234567890");
        reg.mark_failed(&recovering_id, Utc::now());
        let attention = reg.devices_needing_attention();
        assert_eq!(attention.len(), 1);
        assert_eq!(attention[0].device_id, recovering_id);
    }

    #[test]
    fn load_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let reg = DeviceRegistry::load(path.to_str().unwrap()).unwrap();
        assert!(reg.get_all().is_empty());
    }

    #[test]
    fn save_then_load_round_trips_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let mut reg = DeviceRegistry::new();
        reg.register_new("senergy", "SN-1234567890", "/dev/ttyUSB0".into(), serde_json::json!({}));
        let id = device_id_for("senergy", "SN-1234567890");
        reg.permanently_disable(&id);
        reg.save(path.to_str().unwrap()).unwrap();

        let reloaded = DeviceRegistry::load(path.to_str().unwrap()).unwrap();
        assert_eq!(reloaded.get(&id).unwrap().status, DeviceStatus::PermanentlyDisabled);
    }
}
