//! Fatal-at-startup structural validation (spec §7 "Structural"). Grounded
//! on `solarhub/hierarchy/validator.py`'s staged checks, collapsed to the
//! invariants named in spec §3 plus the two extra checks the original
//! performs that the distillation dropped (cross-linked attachment,
//! dangling meter array reference — see SPEC_FULL.md §C).

use std::collections::{HashMap, HashSet};

use crate::error::HierarchyError;

use super::entities::Hierarchy;

/// Runs every structural check; returns the first failure. The original
/// collects all errors before reporting (spec §7 says the process simply
/// "refuses to start" — callers that want every violation at once can loop
/// calling this after fixing each one, matching `validate_hierarchy`'s
/// "ambiguous data migrations do not guess; they require operator
/// intervention").
pub fn validate(h: &Hierarchy) -> Result<(), HierarchyError> {
    let system_ids: HashSet<&str> = h.systems.iter().map(|s| s.system_id.as_str()).collect();

    for ia in &h.inverter_arrays {
        if !system_ids.contains(ia.system_id.as_str()) {
            return Err(HierarchyError::SystemIdMismatch {
                child: ia.array_id.clone(),
                parent: "system".into(),
                child_system: ia.system_id.clone(),
                parent_system: "<missing>".into(),
            });
        }
    }
    for ba in &h.battery_arrays {
        if !system_ids.contains(ba.system_id.as_str()) {
            return Err(HierarchyError::SystemIdMismatch {
                child: ba.array_id.clone(),
                parent: "system".into(),
                child_system: ba.system_id.clone(),
                parent_system: "<missing>".into(),
            });
        }
    }

    let inverter_array_system: HashMap<&str, &str> = h
        .inverter_arrays
        .iter()
        .map(|a| (a.array_id.as_str(), a.system_id.as_str()))
        .collect();
    for inv in &h.inverters {
        match inverter_array_system.get(inv.array_id.as_str()) {
            Some(parent_system) if *parent_system == inv.system_id => {}
            Some(parent_system) => {
                return Err(HierarchyError::SystemIdMismatch {
                    child: inv.inverter_id.clone(),
                    parent: inv.array_id.clone(),
                    child_system: inv.system_id.clone(),
                    parent_system: parent_system.to_string(),
                });
            }
            None => {
                return Err(HierarchyError::SystemIdMismatch {
                    child: inv.inverter_id.clone(),
                    parent: inv.array_id.clone(),
                    child_system: inv.system_id.clone(),
                    parent_system: "<missing array>".into(),
                });
            }
        }
    }

    let battery_array_system: HashMap<&str, &str> = h
        .battery_arrays
        .iter()
        .map(|a| (a.array_id.as_str(), a.system_id.as_str()))
        .collect();
    for pack in &h.packs {
        match battery_array_system.get(pack.array_id.as_str()) {
            Some(parent_system) if *parent_system == pack.system_id => {}
            _ => {
                return Err(HierarchyError::SystemIdMismatch {
                    child: pack.pack_id.clone(),
                    parent: pack.array_id.clone(),
                    child_system: pack.system_id.clone(),
                    parent_system: "<mismatch or missing>".into(),
                });
            }
        }
        if pack.primary_adapter().is_none() {
            return Err(HierarchyError::NoEnabledAdapter(pack.pack_id.clone()));
        }
    }

    for meter in &h.meters {
        if !system_ids.contains(meter.system_id.as_str()) {
            return Err(HierarchyError::SystemIdMismatch {
                child: meter.meter_id.clone(),
                parent: "system".into(),
                child_system: meter.system_id.clone(),
                parent_system: "<missing>".into(),
            });
        }
        if let Some(array_id) = &meter.array_id {
            if !inverter_array_system.contains_key(array_id.as_str()) {
                return Err(HierarchyError::DanglingMeterArray {
                    meter: meter.meter_id.clone(),
                    array: array_id.clone(),
                });
            }
        }
    }

    // At most one active attachment per (battery_array, inverter_array) pair,
    // and no battery array cross-linked to two inverter arrays at once.
    let mut active_by_battery: HashMap<&str, &str> = HashMap::new();
    for att in &h.attachments {
        if !att.is_active() {
            continue;
        }
        if let Some(existing) = active_by_battery.get(att.battery_array_id.as_str()) {
            if *existing != att.inverter_array_id {
                return Err(HierarchyError::CrossLinkedAttachment(att.battery_array_id.clone()));
            }
            return Err(HierarchyError::MultipleActiveAttachments(att.battery_array_id.clone()));
        }
        active_by_battery.insert(att.battery_array_id.as_str(), att.inverter_array_id.as_str());
    }

    // Inverter.adapter_type must be unique among devices holding the same
    // serial port at any instant (spec §3). The hierarchy carries the
    // actual port binding in `adapter_config`'s/`AdapterInstance::config`'s
    // "port" key (the same key `main.rs`'s `HubAdapterFactory` reads to
    // open a transport); this checks two devices never claim the same
    // non-empty port string, across inverters, meters, and battery-pack
    // adapter instances alike, regardless of which array they belong to.
    // A TCP-backed device carries no "port" key and is exempt — a socket
    // address isn't a shared physical resource the way a serial port is.
    let claims: Vec<(String, Option<&str>)> = h
        .inverters
        .iter()
        .map(|inv| (inv.inverter_id.clone(), inv.adapter_config.get("port").and_then(|v| v.as_str())))
        .chain(h.meters.iter().map(|m| (m.meter_id.clone(), m.adapter_config.get("port").and_then(|v| v.as_str()))))
        .chain(
            h.packs
                .iter()
                .flat_map(|p| p.adapters.iter().map(move |a| (format!("{} ({})", p.pack_id, a.adapter_type), a.config.get("port").and_then(|v| v.as_str())))),
        )
        .collect();

    let mut port_owner: HashMap<&str, &str> = HashMap::new();
    for (owner, port) in &claims {
        let Some(port) = port.filter(|p| !p.is_empty()) else { continue };
        if let Some(existing) = port_owner.insert(port, owner.as_str()) {
            return Err(HierarchyError::DuplicatePortBinding(format!("{existing} and {owner} both claim port {port}")));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::devices::{AdapterInstance, Attachment};
    use crate::hierarchy::entities::{BatteryArray, BatteryPack, Inverter, InverterArray, Meter, System};

    fn base_hierarchy() -> Hierarchy {
        let mut h = Hierarchy::default();
        h.systems.push(System {
            system_id: "sys1".into(),
            name: "Home".into(),
            timezone: "UTC".into(),
            inverter_arrays: vec!["arr1".into()],
            battery_arrays: vec!["barr1".into()],
            meters: vec!["m1".into()],
        });
        h.inverter_arrays.push(InverterArray {
            array_id: "arr1".into(),
            system_id: "sys1".into(),
            name: "Roof".into(),
            inverters: vec!["inv1".into()],
        });
        h.inverters.push(Inverter {
            inverter_id: "inv1".into(),
            array_id: "arr1".into(),
            system_id: "sys1".into(),
            adapter_type: "senergy".into(),
            rated_power_w: 5000,
            adapter_config: serde_json::json!({}),
        });
        h.battery_arrays.push(BatteryArray {
            array_id: "barr1".into(),
            system_id: "sys1".into(),
            name: "Basement".into(),
            packs: vec!["pack1".into()],
        });
        h.packs.push(BatteryPack {
            pack_id: "pack1".into(),
            array_id: "barr1".into(),
            system_id: "sys1".into(),
            batteries: vec![],
            adapters: vec![AdapterInstance {
                adapter_type: "bms_active".into(),
                priority: 0,
                enabled: true,
                config: serde_json::json!({}),
            }],
            max_charge_kw: 5.0,
            max_discharge_kw: 5.0,
        });
        h.meters.push(Meter {
            meter_id: "m1".into(),
            system_id: "sys1".into(),
            array_id: Some("arr1".into()),
            adapter_config: serde_json::json!({}),
        });
        h
    }

    #[test]
    fn valid_hierarchy_passes() {
        assert!(validate(&base_hierarchy()).is_ok());
    }

    #[test]
    fn mismatched_system_id_is_fatal() {
        let mut h = base_hierarchy();
        h.inverters[0].system_id = "other".into();
        assert!(matches!(validate(&h), Err(HierarchyError::SystemIdMismatch { .. })));
    }

    #[test]
    fn pack_without_enabled_adapter_is_fatal() {
        let mut h = base_hierarchy();
        h.packs[0].adapters[0].enabled = false;
        assert!(matches!(validate(&h), Err(HierarchyError::NoEnabledAdapter(_))));
    }

    #[test]
    fn dangling_meter_array_is_fatal() {
        let mut h = base_hierarchy();
        h.meters[0].array_id = Some("nonexistent".into());
        assert!(matches!(validate(&h), Err(HierarchyError::DanglingMeterArray { .. })));
    }

    #[test]
    fn double_active_attachment_is_fatal() {
        let mut h = base_hierarchy();
        h.inverter_arrays.push(InverterArray {
            array_id: "arr2".into(),
            system_id: "sys1".into(),
            name: "Garage".into(),
            inverters: vec![],
        });
        h.attachments.push(Attachment::new("barr1", "arr1"));
        h.attachments.push(Attachment::new("barr1", "arr2"));
        assert!(matches!(validate(&h), Err(HierarchyError::CrossLinkedAttachment(_))));
    }

    #[test]
    fn two_devices_on_same_port_is_fatal() {
        let mut h = base_hierarchy();
        h.inverters[0].adapter_config = serde_json::json!({"port": "/dev/ttyUSB0"});
        h.inverters.push(Inverter {
            inverter_id: "inv2".into(),
            array_id: "arr1".into(),
            system_id: "sys1".into(),
            adapter_type: "senergy".into(),
            rated_power_w: 5000,
            adapter_config: serde_json::json!({"port": "/dev/ttyUSB0"}),
        });
        assert!(matches!(validate(&h), Err(HierarchyError::DuplicatePortBinding(_))));
    }

    #[test]
    fn same_adapter_type_on_different_ports_is_fine() {
        let mut h = base_hierarchy();
        h.inverter_arrays.push(InverterArray {
            array_id: "arr2".into(),
            system_id: "sys1".into(),
            name: "Garage".into(),
            inverters: vec!["inv2".into()],
        });
        h.inverters[0].adapter_config = serde_json::json!({"port": "/dev/ttyUSB0"});
        h.inverters.push(Inverter {
            inverter_id: "inv2".into(),
            array_id: "arr2".into(),
            system_id: "sys1".into(),
            adapter_type: "senergy".into(),
            rated_power_w: 5000,
            adapter_config: serde_json::json!({"port": "/dev/ttyUSB1"}),
        });
        assert!(validate(&h).is_ok());
    }

    #[test]
    fn tcp_devices_without_a_port_key_are_exempt() {
        let mut h = base_hierarchy();
        h.inverters[0].adapter_config = serde_json::json!({"host": "10.0.0.5"});
        h.inverters.push(Inverter {
            inverter_id: "inv2".into(),
            array_id: "arr1".into(),
            system_id: "sys1".into(),
            adapter_type: "senergy".into(),
            rated_power_w: 5000,
            adapter_config: serde_json::json!({"host": "10.0.0.6"}),
        });
        assert!(validate(&h).is_ok());
    }
}
