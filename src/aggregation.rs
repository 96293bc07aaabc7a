//! Aggregation Hierarchy (spec §4.6): three stateless functions run on
//! every poll to roll telemetry up from battery unit to pack, pack+inverter
//! to array, and array to system. Grounded on the single-source-of-truth
//! and meter-precedence rules in spec §4.6, adapted from the teacher's
//! `services/power_service.rs` aggregation-by-summation idiom.

use std::collections::HashMap;

use chrono::DateTime;
use chrono_tz::Tz;
use serde_json::json;

use crate::telemetry::{ArrayTelemetry, BatteryBankTelemetry, BatteryUnitRecord, InverterTelemetry, MeterTelemetry, SystemTelemetry};

/// Capacity-weighted mean of unit voltages and SOCs, falling back to a
/// simple mean when no capacity weights are supplied (spec §4.6
/// "PackAggregator").
pub fn aggregate_pack(bank_id: &str, ts: DateTime<Tz>, units: &[BatteryUnitRecord], capacities_kwh: Option<&[f64]>) -> BatteryBankTelemetry {
    let weights: Vec<f64> = match capacities_kwh {
        Some(caps) if caps.len() == units.len() && caps.iter().any(|&c| c > 0.0) => caps.to_vec(),
        _ => vec![1.0; units.len()],
    };
    let total_weight: f64 = weights.iter().sum();

    let weighted = |f: &dyn Fn(&BatteryUnitRecord) -> f64| -> f64 {
        if total_weight <= 0.0 || units.is_empty() {
            return 0.0;
        }
        units.iter().zip(weights.iter()).map(|(u, w)| f(u) * w).sum::<f64>() / total_weight
    };

    let voltage_v = weighted(&|u| u.voltage_v);
    let soc_pct = weighted(&|u| u.soc_pct as f64).round() as u8;
    let current_a = units.iter().map(|u| u.current_a).sum();
    let temperature_c = units.iter().map(|u| u.temperature_c).fold(f64::MIN, f64::max);

    BatteryBankTelemetry {
        bank_id: bank_id.to_string(),
        ts,
        voltage_v,
        current_a,
        temperature_c: if units.is_empty() { 0.0 } else { temperature_c },
        soc_pct,
        batteries_count: units.len() as u8,
        cells_per_battery: 0,
        units: units.to_vec(),
        cells: None,
    }
}

/// PV/load/grid/battery power are component sums across the array's
/// inverters; SOC and voltage come from attached packs only, falling back
/// to inverter-reported values (with an `extra` marker) when no pack is
/// attached (spec §4.6 "ArrayAggregator").
pub fn aggregate_array(
    array_id: &str,
    inverter_ids: &[String],
    inverters: &[InverterTelemetry],
    packs: &[BatteryBankTelemetry],
    pack_limits_kw: &[(f64, f64)],
) -> ArrayTelemetry {
    let oldest_ts = oldest_timestamp(inverters.iter().map(|i| i.ts).chain(packs.iter().map(|p| p.ts)));

    let pv_power_w = inverters.iter().map(|i| i.pv_power_w).sum();
    let load_power_w = inverters.iter().map(|i| i.load_power_w).sum();
    let grid_power_w = inverters.iter().map(|i| i.grid_power_w).sum();
    let batt_power_w = inverters.iter().map(|i| i.batt_power_w).sum();

    let mut extra = HashMap::new();
    let (batt_soc_pct, batt_voltage_v) = if !packs.is_empty() {
        let n = packs.len() as f64;
        (
            (packs.iter().map(|p| p.soc_pct as f64).sum::<f64>() / n).round() as u8,
            packs.iter().map(|p| p.voltage_v).sum::<f64>() / n,
        )
    } else if let Some(first) = inverters.first() {
        extra.insert("soc_source".to_string(), json!("inverter_reported"));
        (first.batt_soc_pct, first.batt_voltage_v)
    } else {
        (0, 0.0)
    };

    let max_charge_kw = pack_limits_kw.iter().map(|(c, _)| c).sum();
    let max_discharge_kw = pack_limits_kw.iter().map(|(_, d)| d).sum();

    let mut member_ids: Vec<String> = inverter_ids.to_vec();
    member_ids.extend(packs.iter().map(|p| p.bank_id.clone()));

    ArrayTelemetry {
        array_id: array_id.to_string(),
        ts: oldest_ts.unwrap_or_else(|| inverters.first().map(|i| i.ts).or_else(|| packs.first().map(|p| p.ts)).expect("at least one contributor")),
        pv_power_w,
        load_power_w,
        grid_power_w,
        batt_power_w,
        batt_soc_pct,
        batt_voltage_v,
        max_charge_kw,
        max_discharge_kw,
        member_ids,
        extra,
    }
}

/// Sums across arrays; meter-measured grid power takes precedence over
/// summed inverter-reported grid power when both are present (spec §4.6
/// "SystemAggregator": "meters are the authoritative point of
/// interconnection measurement").
pub fn aggregate_system(system_id: &str, arrays: &[ArrayTelemetry], meters: &[MeterTelemetry]) -> SystemTelemetry {
    let oldest_ts = oldest_timestamp(arrays.iter().map(|a| a.ts).chain(meters.iter().map(|m| m.ts)));

    let pv_power_w = arrays.iter().map(|a| a.pv_power_w).sum();
    let load_power_w = arrays.iter().map(|a| a.load_power_w).sum();
    let batt_power_w = arrays.iter().map(|a| a.batt_power_w).sum();

    let grid_power_w = if !meters.is_empty() {
        meters.iter().map(|m| m.power_w).sum()
    } else {
        arrays.iter().map(|a| a.grid_power_w).sum()
    };

    let net_import_wh = meters.iter().map(|m| m.daily_import_wh).sum();
    let net_export_wh = meters.iter().map(|m| m.daily_export_wh).sum();

    let mut member_ids: Vec<String> = arrays.iter().map(|a| a.array_id.clone()).collect();
    member_ids.extend(meters.iter().map(|m| m.meter_id.clone()));

    SystemTelemetry {
        system_id: system_id.to_string(),
        ts: oldest_ts.unwrap_or_else(|| arrays.first().map(|a| a.ts).or_else(|| meters.first().map(|m| m.ts)).expect("at least one contributor")),
        pv_power_w,
        load_power_w,
        grid_power_w,
        batt_power_w,
        net_import_wh,
        net_export_wh,
        member_ids,
    }
}

fn oldest_timestamp(ts: impl Iterator<Item = DateTime<Tz>>) -> Option<DateTime<Tz>> {
    ts.min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Tz> {
        Tz::UTC.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    fn unit(voltage: f64, soc: u8) -> BatteryUnitRecord {
        BatteryUnitRecord { voltage_v: voltage, current_a: 1.0, soc_pct: soc, soh_pct: 100, temperature_c: 25.0, cycles: 0, status_flags: 0 }
    }

    #[test]
    fn pack_aggregate_falls_back_to_simple_mean_without_capacity() {
        let units = vec![unit(50.0, 80), unit(52.0, 60)];
        let pack = aggregate_pack("pack1", now(), &units, None);
        assert!((pack.voltage_v - 51.0).abs() < 1e-9);
        assert_eq!(pack.soc_pct, 70);
        assert!((pack.current_a - 2.0).abs() < 1e-9);
    }

    #[test]
    fn pack_aggregate_weights_by_capacity() {
        let units = vec![unit(50.0, 100), unit(52.0, 0)];
        let pack = aggregate_pack("pack1", now(), &units, Some(&[3.0, 1.0]));
        // (50*3 + 52*1) / 4 = 50.5
        assert!((pack.voltage_v - 50.5).abs() < 1e-9);
        assert_eq!(pack.soc_pct, 75);
    }

    #[test]
    fn array_falls_back_to_inverter_soc_without_attached_pack() {
        let inv = InverterTelemetry {
            ts: now(),
            array_id: "arr1".into(),
            pv_power_w: 1000.0,
            load_power_w: 500.0,
            grid_power_w: -500.0,
            batt_power_w: 0.0,
            batt_soc_pct: 42,
            batt_voltage_v: 51.2,
            batt_current_a: 0.0,
            inverter_temp_c: 30.0,
            inverter_mode: "normal".into(),
            extra: HashMap::new(),
        };
        let array = aggregate_array("arr1", &["inv1".to_string()], &[inv], &[], &[]);
        assert_eq!(array.batt_soc_pct, 42);
        assert_eq!(array.extra.get("soc_source").unwrap(), "inverter_reported");
    }

    #[test]
    fn system_prefers_meter_power_over_inverter_sum() {
        let array = ArrayTelemetry {
            array_id: "arr1".into(),
            ts: now(),
            pv_power_w: 1000.0,
            load_power_w: 500.0,
            grid_power_w: -500.0,
            batt_power_w: 0.0,
            batt_soc_pct: 50,
            batt_voltage_v: 51.0,
            max_charge_kw: 5.0,
            max_discharge_kw: 5.0,
            member_ids: vec![],
            extra: HashMap::new(),
        };
        let meter = MeterTelemetry {
            meter_id: "m1".into(),
            ts: now(),
            voltage_v: 230.0,
            current_a: 2.0,
            power_w: -300.0,
            frequency_hz: 50.0,
            power_factor: 1.0,
            cumulative_import_wh: 0.0,
            cumulative_export_wh: 0.0,
            daily_import_wh: 0.0,
            daily_export_wh: 300.0,
        };
        let system = aggregate_system("sys1", &[array], &[meter]);
        assert_eq!(system.grid_power_w, -300.0);
    }
}
