//! Smart Scheduler (spec §4.8), one instance per inverter array. A pure
//! decision procedure invoked on the orchestrator's `smart_tick` cadence;
//! its output is a set of idempotent register writes routed through the
//! `CommandQueue`'s `inverter_config` action. Grounded on
//! `solarhub/scheduler/smart_scheduler.py`'s seven-step decision order.

use std::collections::HashMap;

use crate::config::{PrimaryMode, SchedulerPolicy, SplitPolicy, TariffKind, TariffWindow};

/// Forecast plus the sun-geometry facts the deadline computation needs.
/// Not explicitly listed as scheduler "inputs" in spec §4.8, but step 3
/// ("integrating forecast.today from now to sunset - ...") requires a
/// sunrise/sunset pair to prorate the daily forecast total across daylight
/// hours; folded into `Forecast` rather than invented as a separate input.
#[derive(Debug, Clone, Copy)]
pub struct Forecast {
    pub today_kwh: f64,
    pub tomorrow_kwh: f64,
    pub sunrise_minute: u16,
    pub sunset_minute: u16,
}

/// Named-interface-only collaborator (spec §1 Non-goals: "weather-forecast
/// providers remain named-interface-only"). The Orchestrator supplies a
/// concrete implementation; this crate only needs the shape.
pub trait ForecastProvider: Send + Sync {
    fn forecast(&self, array_id: &str) -> Forecast;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridAvailability {
    Available,
    Lost,
}

/// `GridAvailable <-> GridLost` transitions on observed grid power going to
/// exactly zero while the inverter reports off-grid mode (spec §4.8 "State
/// machine for grid availability").
#[derive(Debug, Clone, Copy)]
pub struct GridStateMachine {
    state: GridAvailability,
}

impl GridStateMachine {
    pub fn new() -> Self {
        Self { state: GridAvailability::Available }
    }

    pub fn observe(&mut self, grid_power_w: f64, inverter_off_grid: bool) {
        let off_grid_and_dark = grid_power_w == 0.0 && inverter_off_grid;
        self.state = match (self.state, off_grid_and_dark) {
            (GridAvailability::Available, true) => GridAvailability::Lost,
            (GridAvailability::Lost, false) => GridAvailability::Available,
            (state, _) => state,
        };
    }

    pub fn state(&self) -> GridAvailability {
        self.state
    }
}

impl Default for GridStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-inverter facts needed by the split policies (spec §4.8 step 6).
#[derive(Debug, Clone)]
pub struct SchedulerInverterInput {
    pub inverter_id: String,
    pub rated_power_w: u32,
    pub current_output_w: f64,
}

/// A register write the scheduler wants applied, already deduplicated
/// against the last value published for this `(inverter_id, sensor_id)`
/// pair (spec §9 "Command idempotence").
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub inverter_id: String,
    pub sensor_id: String,
    pub value: serde_json::Value,
}

/// Parses "HH:MM" into minutes since local midnight.
fn parse_hhmm(s: &str) -> u16 {
    let mut parts = s.splitn(2, ':');
    let h: u16 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let m: u16 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    h * 60 + m
}

/// Whether `minute` falls within `[start, end)`, handling windows that wrap
/// past midnight (`end < start`).
fn window_contains(window: &TariffWindow, minute: u16) -> bool {
    let start = parse_hhmm(&window.start);
    let end = parse_hhmm(&window.end);
    if start <= end {
        minute >= start && minute < end
    } else {
        minute >= start || minute < end
    }
}

/// Highest-`priority` window covering `minute`, or a synthetic "normal"
/// window if none match (spec §4.8 step 1).
fn active_window(tariffs: &[TariffWindow], minute: u16) -> TariffWindow {
    tariffs
        .iter()
        .filter(|w| window_contains(w, minute))
        .max_by_key(|w| w.priority)
        .cloned()
        .unwrap_or(TariffWindow {
            kind: TariffKind::Normal,
            start: "00:00".into(),
            end: "00:00".into(),
            price: 0.0,
            allow_grid_charge: false,
            allow_discharge: true,
            priority: 0,
            peak_shaving_enabled: false,
        })
}

fn effective_primary_mode(policy: &SchedulerPolicy, soc_pct: u8, forecast_today_kwh: f64) -> PrimaryMode {
    if !policy.enable_auto_mode_switching {
        return policy.primary_mode;
    }
    let close_to_target = (policy.max_battery_soc_pct as i32 - soc_pct as i32).unsigned_abs() as u8 <= policy.close_to_target_threshold_pct;
    let bad_forecast = forecast_today_kwh < policy.poor_weather_threshold_kwh;
    if close_to_target || bad_forecast {
        PrimaryMode::SelfUse
    } else {
        policy.primary_mode
    }
}

/// Prorates `forecast.today_kwh` uniformly across daylight minutes to
/// estimate the solar energy still available between `now` and
/// `sunset - deadline_hours_before_sunset` (spec §4.8 step 3).
fn solar_to_deadline_kwh(forecast: &Forecast, now_minute: u16, deadline_hours_before_sunset: f64) -> (f64, f64) {
    let daylight_minutes = forecast.sunset_minute.saturating_sub(forecast.sunrise_minute) as f64;
    if daylight_minutes <= 0.0 {
        return (0.0, 0.0);
    }
    let deadline_minute = forecast.sunset_minute as f64 - deadline_hours_before_sunset * 60.0;
    let remaining_minutes = (deadline_minute - now_minute as f64).max(0.0);
    let kwh = forecast.today_kwh * (remaining_minutes / daylight_minutes);
    (kwh, remaining_minutes / 60.0)
}

/// Steps 3-4: whether grid charging is needed to reach `max_battery_soc_pct`
/// before the deadline, and if so at what clamped power.
fn grid_charge_need(policy: &SchedulerPolicy, soc_pct: u8, forecast: &Forecast, now_minute: u16) -> Option<f64> {
    let required_kwh = (policy.max_battery_soc_pct as f64 - soc_pct as f64) * policy.pack_nominal_kwh / 100.0;
    if required_kwh <= 0.0 {
        return None;
    }
    let (solar_kwh, hours_remaining) = solar_to_deadline_kwh(forecast, now_minute, policy.solar_charge_deadline_hours_before_sunset);
    if hours_remaining <= 0.0 {
        return None;
    }
    let expected_load_kwh = policy.load_fallback_kw * hours_remaining;
    let net_until_deadline = solar_kwh - expected_load_kwh;
    if net_until_deadline >= required_kwh {
        return None;
    }
    let power_w = (required_kwh - net_until_deadline) * 1000.0 / hours_remaining;
    Some(power_w.min(policy.max_grid_charge_w as f64))
}

fn emergency_floor(policy: &SchedulerPolicy, grid_available: bool) -> u8 {
    let base = if grid_available {
        policy.emergency_soc_threshold_grid_available_pct
    } else {
        policy.emergency_soc_threshold_grid_unavailable_pct
    };
    base.saturating_add(policy.reliability_buffer_pct)
}

/// Step 6: splits `total_w` across `inverters` per the configured policy,
/// rounds to `step_w`, and zeroes shares below `min_w_per_inverter`.
fn split_power(total_w: f64, inverters: &[SchedulerInverterInput], policy: &SchedulerPolicy) -> HashMap<String, u32> {
    let mut shares: HashMap<String, f64> = HashMap::new();
    if inverters.is_empty() || total_w <= 0.0 {
        return HashMap::new();
    }
    match policy.split_policy {
        SplitPolicy::Equal => {
            let each = total_w / inverters.len() as f64;
            for inv in inverters {
                shares.insert(inv.inverter_id.clone(), each);
            }
        }
        SplitPolicy::Rated => {
            let total_rated: f64 = inverters.iter().map(|i| i.rated_power_w as f64).sum();
            for inv in inverters {
                let fraction = if total_rated > 0.0 { inv.rated_power_w as f64 / total_rated } else { 1.0 / inverters.len() as f64 };
                shares.insert(inv.inverter_id.clone(), total_w * fraction);
            }
        }
        SplitPolicy::Headroom => {
            let headrooms: Vec<f64> = inverters.iter().map(|i| (i.rated_power_w as f64 - i.current_output_w).max(0.0)).collect();
            let total_headroom: f64 = headrooms.iter().sum();
            for (inv, headroom) in inverters.iter().zip(headrooms.iter()) {
                let fraction = if total_headroom > 0.0 { headroom / total_headroom } else { 1.0 / inverters.len() as f64 };
                shares.insert(inv.inverter_id.clone(), total_w * fraction);
            }
        }
    }

    let step = policy.step_w.max(1) as f64;
    shares
        .into_iter()
        .map(|(id, w)| (id, ((w / step).round() * step) as u32))
        .filter(|(_, w)| *w >= policy.min_w_per_inverter)
        .collect()
}

pub struct SmartScheduler {
    policy: SchedulerPolicy,
    tariffs: Vec<TariffWindow>,
    grid: GridStateMachine,
    last_published: HashMap<(String, String), serde_json::Value>,
}

impl SmartScheduler {
    pub fn new(policy: SchedulerPolicy, tariffs: Vec<TariffWindow>) -> Self {
        Self { policy, tariffs, grid: GridStateMachine::new(), last_published: HashMap::new() }
    }

    pub fn grid_state(&self) -> GridAvailability {
        self.grid.state()
    }

    /// Runs the full seven-step decision procedure and returns only the
    /// writes whose value changed since the last tick (spec §4.8 step 7,
    /// spec §9 "Command idempotence").
    pub fn tick(
        &mut self,
        soc_pct: u8,
        grid_power_w: f64,
        inverter_off_grid: bool,
        forecast: &Forecast,
        now_minute: u16,
        inverters: &[SchedulerInverterInput],
    ) -> Vec<PendingWrite> {
        self.grid.observe(grid_power_w, inverter_off_grid);
        let grid_available = self.grid.state() == GridAvailability::Available;

        let window = active_window(&self.tariffs, now_minute);
        let mode = effective_primary_mode(&self.policy, soc_pct, forecast.today_kwh);
        let mode_label = match mode {
            PrimaryMode::SelfUse => "self_use",
            PrimaryMode::TimeBased => "time_based",
        };

        let mut writes = Vec::new();

        for inv in inverters {
            self.push_if_changed(&mut writes, &inv.inverter_id, "effective_primary_mode", serde_json::json!(mode_label));
        }

        let charge_power_w = if window.allow_grid_charge { grid_charge_need(&self.policy, soc_pct, forecast, now_minute) } else { None };

        if let Some(power_w) = charge_power_w {
            let shares = split_power(power_w, inverters, &self.policy);
            for (inverter_id, share_w) in shares {
                self.push_if_changed(&mut writes, &inverter_id, "grid_charge_power_w", serde_json::json!(share_w));
            }
        } else {
            for inv in inverters {
                self.push_if_changed(&mut writes, &inv.inverter_id, "grid_charge_power_w", serde_json::json!(0));
            }
        }

        let discharge_floor = emergency_floor(&self.policy, grid_available);
        for inv in inverters {
            self.push_if_changed(&mut writes, &inv.inverter_id, "discharge_floor_soc_pct", serde_json::json!(discharge_floor));
            self.push_if_changed(&mut writes, &inv.inverter_id, "discharge_enabled", serde_json::json!(window.allow_discharge && matches!(window.kind, TariffKind::Peak)));
        }

        writes
    }

    fn push_if_changed(&mut self, writes: &mut Vec<PendingWrite>, inverter_id: &str, sensor_id: &str, value: serde_json::Value) {
        let key = (inverter_id.to_string(), sensor_id.to_string());
        if self.last_published.get(&key) == Some(&value) {
            return;
        }
        self.last_published.insert(key, value.clone());
        writes.push(PendingWrite { inverter_id: inverter_id.to_string(), sensor_id: sensor_id.to_string(), value });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrimaryMode;

    fn base_policy() -> SchedulerPolicy {
        SchedulerPolicy {
            primary_mode: PrimaryMode::SelfUse,
            enable_auto_mode_switching: false,
            overnight_min_soc_pct: 30,
            blackout_reserve_soc_pct: 30,
            emergency_soc_threshold_grid_available_pct: 15,
            emergency_soc_threshold_grid_unavailable_pct: 25,
            critical_soc_threshold_grid_available_pct: 10,
            critical_soc_threshold_grid_unavailable_pct: 20,
            off_grid_startup_soc_pct: 40,
            target_full_before_sunset: true,
            max_battery_soc_pct: 100,
            max_charge_power_w: 5000,
            max_discharge_power_w: 5000,
            max_grid_charge_w: 3000,
            min_self_sufficiency_pct: 50,
            target_self_sufficiency_pct: 80,
            max_grid_usage_kwh_per_day: 10.0,
            emergency_reserve_hours: 4.0,
            conserve_on_bad_tomorrow: true,
            bad_sun_threshold_kwh: 5.0,
            poor_weather_threshold_kwh: 10.0,
            solar_target_threshold_pct: 90,
            close_to_target_threshold_pct: 5,
            load_fallback_kw: 1.0,
            solar_charge_deadline_hours_before_sunset: 1.0,
            pack_nominal_kwh: 20.0,
            split_policy: SplitPolicy::Equal,
            step_w: 100,
            min_w_per_inverter: 200,
            reliability_buffer_pct: 5,
        }
    }

    fn sunny_forecast() -> Forecast {
        Forecast { today_kwh: 30.0, tomorrow_kwh: 30.0, sunrise_minute: 6 * 60, sunset_minute: 18 * 60 }
    }

    #[test]
    fn sunny_day_needs_no_grid_charge() {
        // Scenario 3: SOC=45, forecast.today=30kWh, now=10:00.
        let need = grid_charge_need(&base_policy(), 45, &sunny_forecast(), 10 * 60);
        assert!(need.is_none());
    }

    #[test]
    fn bad_forecast_enqueues_clamped_grid_charge() {
        // Scenario 4: same as 3 but forecast.today=5kWh.
        let forecast = Forecast { today_kwh: 5.0, ..sunny_forecast() };
        let need = grid_charge_need(&base_policy(), 45, &forecast, 10 * 60);
        assert!(need.is_some());
        assert!(need.unwrap() <= base_policy().max_grid_charge_w as f64);
    }

    #[test]
    fn tariff_window_wraps_midnight() {
        let tariffs = vec![TariffWindow {
            kind: TariffKind::Cheap,
            start: "23:00".into(),
            end: "06:00".into(),
            price: 0.1,
            allow_grid_charge: true,
            allow_discharge: false,
            priority: 1,
            peak_shaving_enabled: false,
        }];
        let late = active_window(&tariffs, 23 * 60 + 59);
        let early = active_window(&tariffs, 1);
        assert!(matches!(late.kind, TariffKind::Cheap));
        assert!(matches!(early.kind, TariffKind::Cheap));
    }

    #[test]
    fn repeated_tick_with_same_inputs_emits_no_writes_second_time() {
        let mut scheduler = SmartScheduler::new(base_policy(), vec![]);
        let inverters = vec![SchedulerInverterInput { inverter_id: "inv1".into(), rated_power_w: 5000, current_output_w: 1000.0 }];
        let forecast = Forecast { today_kwh: 5.0, ..sunny_forecast() };
        let first = scheduler.tick(45, 100.0, false, &forecast, 10 * 60, &inverters);
        assert!(!first.is_empty());
        let second = scheduler.tick(45, 100.0, false, &forecast, 10 * 60, &inverters);
        assert!(second.is_empty());
    }

    #[test]
    fn grid_state_machine_transitions_on_off_grid_zero_power() {
        let mut grid = GridStateMachine::new();
        assert_eq!(grid.state(), GridAvailability::Available);
        grid.observe(0.0, true);
        assert_eq!(grid.state(), GridAvailability::Lost);
        grid.observe(500.0, false);
        assert_eq!(grid.state(), GridAvailability::Available);
    }
}
