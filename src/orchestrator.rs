//! Orchestrator (spec §4.7): owns the main polling loop and the lifecycle
//! of every other subsystem. Grounded on the teacher's per-plant
//! `tokio::spawn` polling loop in `main.rs`, generalized from "one task per
//! plant on a fixed sleep" to a single bounded-concurrency tick that fans
//! out across inverters, battery banks, and meters together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use futures_util::stream::{self, StreamExt};
use log::{debug, error, info, warn};

use crate::adapters::DeviceAdapter;
use crate::aggregation::{aggregate_array, aggregate_system};
use crate::bus::{to_payload, topics, Bus};
use crate::config::Config;
use crate::energy::{sum_rows, EnergyAccumulator};
use crate::hierarchy::Hierarchy;
use crate::queue::{AdapterHandle, CommandQueue, ConfigHandler, TelemetrySlots};
use crate::scheduler::{ForecastProvider, SchedulerInverterInput, SmartScheduler};
use crate::store::TelemetryStore;
use crate::telemetry::{BatteryBankTelemetry, InverterTelemetry, MeterTelemetry, TelemetryManager};

enum PollOutcome {
    Inverter(String, Option<InverterTelemetry>),
    Battery(String, Option<BatteryBankTelemetry>),
    Meter(String, Option<MeterTelemetry>),
}

/// Two atomic flags checked at the top of every tick (spec §4.7
/// "Suspend/resume"). A real single lock would serialize the two checks;
/// since only the Orchestrator's own tick loop ever reads or writes them,
/// a pair of atomics gives the same effective exclusion without adding a
/// mutex the rest of the loop doesn't otherwise need.
#[derive(Clone, Default)]
pub struct HotReconfigFlags {
    disconnect_requested: Arc<AtomicBool>,
    reconnect_requested: Arc<AtomicBool>,
}

impl HotReconfigFlags {
    pub fn request_disconnect(&self) {
        self.disconnect_requested.store(true, Ordering::SeqCst);
    }

    pub fn request_reconnect(&self) {
        self.reconnect_requested.store(true, Ordering::SeqCst);
    }
}

pub struct Orchestrator {
    config: Config,
    tz: Tz,
    hierarchy: Hierarchy,
    bus: Arc<dyn Bus>,
    store: Option<Arc<dyn TelemetryStore>>,
    forecast: Arc<dyn ForecastProvider>,

    telemetry: TelemetryManager,
    energy: EnergyAccumulator,
    queue: CommandQueue,
    slots: TelemetrySlots,

    inverter_adapters: HashMap<String, AdapterHandle>,
    battery_adapters: HashMap<String, AdapterHandle>,
    meter_adapters: HashMap<String, AdapterHandle>,

    schedulers: HashMap<String, SmartScheduler>,
    flags: HotReconfigFlags,
    transports_open: bool,

    smart_tick_elapsed_secs: u64,
    last_rolled_hour: Option<(NaiveDate, u8)>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        tz: Tz,
        hierarchy: Hierarchy,
        bus: Arc<dyn Bus>,
        store: Option<Arc<dyn TelemetryStore>>,
        forecast: Arc<dyn ForecastProvider>,
        inverter_adapters: HashMap<String, AdapterHandle>,
        battery_adapters: HashMap<String, AdapterHandle>,
        meter_adapters: HashMap<String, AdapterHandle>,
        config_handler: ConfigHandler,
    ) -> Self {
        let mut schedulers = HashMap::new();
        for array in &hierarchy.inverter_arrays {
            schedulers.insert(array.array_id.clone(), SmartScheduler::new(config.smart.policy.clone(), config.smart.tariffs.clone()));
        }

        let mut queue = CommandQueue::new(config.queue.capacity, Duration::from_secs(config.queue.enqueue_wait_secs));
        let slots = TelemetrySlots::new(Duration::from_secs(config.polling.interval_secs));
        queue.start(inverter_adapters.clone(), slots.clone(), Duration::from_secs(config.queue.command_timeout_secs), config_handler);

        Self {
            config,
            tz,
            hierarchy,
            bus,
            store,
            forecast,
            telemetry: TelemetryManager::new(),
            energy: EnergyAccumulator::new(),
            queue,
            slots,
            inverter_adapters,
            battery_adapters,
            meter_adapters,
            schedulers,
            flags: HotReconfigFlags::default(),
            transports_open: true,
            smart_tick_elapsed_secs: 0,
            last_rolled_hour: None,
        }
    }

    pub fn hot_reconfig_flags(&self) -> HotReconfigFlags {
        self.flags.clone()
    }

    pub fn command_queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Cheap enqueue handle for the bus command router, which runs
    /// independently of the polling loop `run()` drives.
    pub fn command_queue_handle(&self) -> crate::queue::QueueHandle {
        self.queue.handle()
    }

    /// Runs until the process is terminated. Each iteration performs one
    /// poll tick, then (on the configured cadence) a scheduler tick and an
    /// hour-boundary energy rollup check.
    pub async fn run(&mut self) {
        self.startup_backfill().await;

        let interval = Duration::from_secs(self.config.polling.interval_secs.max(1));
        loop {
            self.check_hot_reconfig().await;

            if self.transports_open {
                self.tick().await;
                self.smart_tick_elapsed_secs += interval.as_secs();
                if self.smart_tick_elapsed_secs >= self.config.polling.smart_tick_interval_secs {
                    self.smart_tick_elapsed_secs = 0;
                    self.run_schedulers().await;
                }
                self.check_hour_rollup().await;
            } else {
                debug!("transports closed, skipping tick");
            }

            tokio::time::sleep(interval).await;
        }
    }

    async fn check_hot_reconfig(&mut self) {
        if self.flags.disconnect_requested.swap(false, Ordering::SeqCst) {
            info!("disconnect requested: closing all transports");
            for adapter in self.all_adapters() {
                adapter.lock().await.close().await;
            }
            self.transports_open = false;
        }
        if self.flags.reconnect_requested.swap(false, Ordering::SeqCst) {
            info!("reconnect requested: reopening all transports");
            for adapter in self.all_adapters() {
                if let Err(err) = adapter.lock().await.connect().await {
                    warn!("reconnect failed for an adapter: {err}");
                }
            }
            self.transports_open = true;
        }
    }

    fn all_adapters(&self) -> impl Iterator<Item = &AdapterHandle> {
        self.inverter_adapters.values().chain(self.battery_adapters.values()).chain(self.meter_adapters.values())
    }

    /// Fans out a poll across every known device, bounded by
    /// `polling.concurrent` (spec §4.7 "Tick cadence"). I/O runs
    /// concurrently; every state mutation (telemetry rings, energy
    /// accumulator, bus publish) happens back on this task afterward, so
    /// no lock is needed around either structure despite the fan-out.
    async fn tick(&mut self) {
        let concurrency = self.config.polling.concurrent.max(1);

        let inverter_futs = self.inverter_adapters.iter().map(|(id, handle)| {
            let id = id.clone();
            let handle = handle.clone();
            let tz = self.tz;
            Box::pin(async move { PollOutcome::Inverter(id, poll_inverter(&handle, tz).await) }) as std::pin::Pin<Box<dyn std::future::Future<Output = PollOutcome> + Send>>
        });
        let battery_futs = self.battery_adapters.iter().map(|(id, handle)| {
            let id = id.clone();
            let handle = handle.clone();
            let tz = self.tz;
            Box::pin(async move { PollOutcome::Battery(id, poll_battery(&handle, tz).await) }) as std::pin::Pin<Box<dyn std::future::Future<Output = PollOutcome> + Send>>
        });
        let meter_futs = self.meter_adapters.iter().map(|(id, handle)| {
            let id = id.clone();
            let handle = handle.clone();
            let tz = self.tz;
            Box::pin(async move { PollOutcome::Meter(id, poll_meter(&handle, tz).await) }) as std::pin::Pin<Box<dyn std::future::Future<Output = PollOutcome> + Send>>
        });

        let results: Vec<PollOutcome> = stream::iter(inverter_futs.chain(battery_futs).chain(meter_futs)).buffer_unordered(concurrency).collect().await;

        for outcome in results {
            self.apply_poll_outcome(outcome).await;
        }

        self.publish_aggregates().await;
    }

    async fn apply_poll_outcome(&mut self, outcome: PollOutcome) {
        match outcome {
            PollOutcome::Inverter(id, Some(tel)) => {
                self.slots.notify_telemetry_polling(&id).await;
                if let Some(store) = &self.store {
                    if let Err(err) = store.insert_sample(&id, &tel).await {
                        warn!("insert_sample({id}) failed: {err}");
                    }
                }
                self.energy.record_sample(&id, tel.ts, tel.pv_power_w, tel.load_power_w, tel.grid_power_w, tel.batt_power_w);
                let payload = to_payload(&tel);
                self.telemetry.record_inverter(&id, tel);
                let topic = topics::inverter_regs(&self.config.bus.base_topic, &id);
                if let Err(err) = self.bus.publish(&topic, payload, false).await {
                    warn!("publish {topic} failed: {err}");
                }
            }
            PollOutcome::Inverter(id, None) => debug!("inverter {id} disconnected, skipping"),
            PollOutcome::Battery(id, Some(tel)) => {
                if let Some(store) = &self.store {
                    if let Err(err) = store.insert_battery_bank_sample(&id, &tel).await {
                        warn!("insert_battery_bank_sample({id}) failed: {err}");
                    }
                    if let Err(err) = store.insert_battery_unit_samples(&id, &tel.units).await {
                        warn!("insert_battery_unit_samples({id}) failed: {err}");
                    }
                    if let Some(cells) = &tel.cells {
                        for (unit, cell_row) in cells.iter().enumerate() {
                            if let Err(err) = store.insert_battery_cell_samples(&id, unit, cell_row).await {
                                warn!("insert_battery_cell_samples({id}, {unit}) failed: {err}");
                            }
                        }
                    }
                }
                for (unit, record) in tel.units.iter().enumerate() {
                    let topic = topics::battery_unit_regs(&self.config.bus.base_topic, &id, unit);
                    if let Err(err) = self.bus.publish(&topic, to_payload(record), false).await {
                        warn!("publish {topic} failed: {err}");
                    }
                }
                if let Some(cells) = &tel.cells {
                    for (unit, cell_row) in cells.iter().enumerate() {
                        for (idx, cell) in cell_row.iter().enumerate() {
                            let topic = topics::battery_cell_regs(&self.config.bus.base_topic, &id, unit, idx);
                            if let Err(err) = self.bus.publish(&topic, to_payload(cell), false).await {
                                warn!("publish {topic} failed: {err}");
                            }
                        }
                    }
                }
                let payload = to_payload(&tel);
                self.telemetry.record_bank(&id, tel);
                let topic = topics::battery_bank_regs(&self.config.bus.base_topic, &id);
                if let Err(err) = self.bus.publish(&topic, payload, false).await {
                    warn!("publish {topic} failed: {err}");
                }
            }
            PollOutcome::Battery(id, None) => debug!("battery bank {id} disconnected, skipping"),
            PollOutcome::Meter(id, Some(tel)) => {
                if let Some(store) = &self.store {
                    if let Err(err) = store.insert_meter_sample(&id, &tel).await {
                        warn!("insert_meter_sample({id}) failed: {err}");
                    }
                }
                let payload = to_payload(&tel);
                self.telemetry.record_meter(&id, tel);
                let topic = topics::meter_regs(&self.config.bus.base_topic, &id);
                if let Err(err) = self.bus.publish(&topic, payload, false).await {
                    warn!("publish {topic} failed: {err}");
                }
            }
            PollOutcome::Meter(id, None) => debug!("meter {id} disconnected, skipping"),
        }
    }

    /// Array then system aggregation (spec §4.6/§4.7): one `state` publish
    /// per array, one per system.
    async fn publish_aggregates(&mut self) {
        let base = self.config.bus.base_topic.clone();

        for array in self.hierarchy.inverter_arrays.clone() {
            let inverter_ids: Vec<String> = array.inverters.clone();
            let inverter_tel: Vec<InverterTelemetry> = inverter_ids.iter().filter_map(|id| self.telemetry.latest_inverter(id).cloned()).collect();

            let (pack_tel, pack_limits) = self
                .hierarchy
                .active_attachment_for_inverter_array(&array.array_id)
                .and_then(|att| {
                    let bank = self.telemetry.latest_bank(&att.battery_array_id).cloned()?;
                    let pack = self.hierarchy.packs.iter().find(|p| p.array_id == att.battery_array_id)?;
                    Some((vec![bank], vec![(pack.max_charge_kw, pack.max_discharge_kw)]))
                })
                .unwrap_or_default();

            if inverter_tel.is_empty() {
                continue;
            }
            let array_tel = aggregate_array(&array.array_id, &inverter_ids, &inverter_tel, &pack_tel, &pack_limits);
            let payload = to_payload(&array_tel);
            self.telemetry.record_array(&array.array_id, array_tel);
            let topic = topics::array_state(&base, &array.array_id);
            if let Err(err) = self.bus.publish(&topic, payload, false).await {
                warn!("publish {topic} failed: {err}");
            }
        }

        for system in self.hierarchy.systems.clone() {
            let arrays: Vec<_> = system.inverter_arrays.iter().filter_map(|id| self.telemetry.latest_array(id).cloned()).collect();
            let meters: Vec<_> = system.meters.iter().filter_map(|id| self.telemetry.latest_meter(id).cloned()).collect();
            if arrays.is_empty() {
                continue;
            }
            let system_tel = aggregate_system(&system.system_id, &arrays, &meters);
            let payload = to_payload(&system_tel);
            self.telemetry.record_system(&system.system_id, system_tel);
            let topic = topics::system_state(&base, &system.system_id);
            if let Err(err) = self.bus.publish(&topic, payload, false).await {
                warn!("publish {topic} failed: {err}");
            }
        }
    }

    /// Invokes each array's `SmartScheduler` on the `smart_tick_interval_secs`
    /// cadence (spec §4.7 "Scheduler tick") and enqueues the resulting
    /// writes as idempotent inverter-config commands.
    async fn run_schedulers(&mut self) {
        let now_minute = {
            let now = Utc::now().with_timezone(&self.tz);
            now.hour() as u16 * 60 + now.minute() as u16
        };

        for array in self.hierarchy.inverter_arrays.clone() {
            let Some(array_tel) = self.telemetry.latest_array(&array.array_id).cloned() else { continue };
            let Some(system) = self.hierarchy.systems.iter().find(|s| s.inverter_arrays.contains(&array.array_id)) else { continue };
            let grid_power_w = self.telemetry.latest_system(&system.system_id).map(|s| s.grid_power_w).unwrap_or(array_tel.grid_power_w);

            let inverters: Vec<SchedulerInverterInput> = array
                .inverters
                .iter()
                .filter_map(|id| {
                    let tel = self.telemetry.latest_inverter(id)?;
                    let rated = self.hierarchy.inverters.iter().find(|i| &i.inverter_id == id)?.rated_power_w;
                    Some(SchedulerInverterInput { inverter_id: id.clone(), rated_power_w: rated, current_output_w: tel.pv_power_w })
                })
                .collect();
            if inverters.is_empty() {
                continue;
            }

            let forecast = self.forecast.forecast(&array.array_id);
            let inverter_off_grid = self.telemetry.latest_inverter(&inverters[0].inverter_id).map(|t| t.inverter_mode == "off_grid").unwrap_or(false);

            let Some(scheduler) = self.schedulers.get_mut(&array.array_id) else { continue };
            let writes = scheduler.tick(array_tel.batt_soc_pct, grid_power_w, inverter_off_grid, &forecast, now_minute, &inverters);

            for write in writes {
                let action = crate::queue::CommandAction::InverterConfig { sensor_id: write.sensor_id, value: write.value };
                let command = crate::queue::InverterCommand::new(write.inverter_id.clone(), action).with_max_retries(self.config.queue.max_retries);
                if let Err(err) = self.queue.enqueue(command).await {
                    warn!("scheduler write for {} rejected: {err}", write.inverter_id);
                }
            }
        }
    }

    /// Materializes the just-completed local hour for every known
    /// inverter, then derives array/system rows by summation (spec §4.9).
    /// Checked every tick rather than from a separate task: the
    /// accumulator is written only from this loop (spec §5's single-writer
    /// rule for last-telemetry maps applies equally here), so folding the
    /// check into the tick avoids sharing it across a concurrency domain.
    async fn check_hour_rollup(&mut self) {
        let now = Utc::now().with_timezone(&self.tz);
        let current = (now.date_naive(), now.hour() as u8);
        let Some((prev_date, prev_hour)) = self.last_rolled_hour else {
            self.last_rolled_hour = Some(current);
            return;
        };
        if current == (prev_date, prev_hour) {
            return;
        }
        self.last_rolled_hour = Some(current);

        let inverter_ids: Vec<String> = self.energy.known_inverters().cloned().collect();
        let mut per_array: HashMap<String, Vec<crate::energy::HourlyEnergyRow>> = HashMap::new();

        for inverter_id in &inverter_ids {
            let Some(row) = self.energy.materialize_hour(inverter_id, prev_date, prev_hour) else { continue };
            if let Some(store) = &self.store {
                if let Err(err) = store.upsert_hourly_energy(&row).await {
                    warn!("upsert_hourly_energy({inverter_id}) failed: {err}");
                }
                if let Err(err) = store.upsert_daily_pv(prev_date, inverter_id, row.solar_energy_kwh).await {
                    warn!("upsert_daily_pv({inverter_id}) failed: {err}");
                }
            }
            if let Some(array) = self.hierarchy.inverter_arrays.iter().find(|a| a.inverters.contains(inverter_id)) {
                per_array.entry(array.array_id.clone()).or_default().push(row);
            }
        }

        for (array_id, rows) in &per_array {
            let array_row = sum_rows(array_id, prev_date, prev_hour, rows);
            if let Some(store) = &self.store {
                if let Err(err) = store.upsert_hourly_energy(&array_row).await {
                    warn!("upsert_hourly_energy(array {array_id}) failed: {err}");
                }
            }
        }
    }

    /// One-time startup backfill (spec §4.7 "Startup discovery handoff"
    /// paragraph's sibling bullet): fills any hours from local midnight up
    /// to the last completed hour. On a freshly started process the
    /// in-memory accumulator has nothing to backfill from yet — there is
    /// no `TelemetryStore` operation to pull raw historical samples back
    /// in (spec §6 only lists write-shaped methods) — so this call is a
    /// no-op until the accumulator has collected its own samples; it
    /// exists so a future `TelemetryStore` that does support historical
    /// reads has a single call site to extend.
    async fn startup_backfill(&mut self) {
        let now = Utc::now().with_timezone(&self.tz);
        let midnight = self.tz.with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0).single().unwrap_or(now);
        for inverter_id in self.energy.known_inverters().cloned().collect::<Vec<_>>() {
            for row in self.energy.backfill_hours(&inverter_id, midnight, now) {
                if let Some(store) = &self.store {
                    if let Err(err) = store.upsert_hourly_energy(&row).await {
                        warn!("startup backfill upsert failed for {inverter_id}: {err}");
                    }
                }
            }
        }
        self.last_rolled_hour = Some((now.date_naive(), now.hour() as u8));
    }
}

async fn poll_inverter(handle: &AdapterHandle, tz: Tz) -> Option<InverterTelemetry> {
    let mut guard = handle.lock().await;
    if !guard.check_connectivity().await {
        return None;
    }
    match guard.poll_inverter(tz).await {
        Ok(tel) => Some(tel),
        Err(err) => {
            error!("poll_inverter failed: {err}");
            None
        }
    }
}

async fn poll_battery(handle: &AdapterHandle, tz: Tz) -> Option<BatteryBankTelemetry> {
    let mut guard = handle.lock().await;
    if !guard.check_connectivity().await {
        return None;
    }
    match guard.poll_battery(tz).await {
        Ok(tel) => Some(tel),
        Err(err) => {
            error!("poll_battery failed: {err}");
            None
        }
    }
}

async fn poll_meter(handle: &AdapterHandle, tz: Tz) -> Option<MeterTelemetry> {
    let mut guard = handle.lock().await;
    if !guard.check_connectivity().await {
        return None;
    }
    match guard.poll_meter(tz).await {
        Ok(tel) => Some(tel),
        Err(err) => {
            error!("poll_meter failed: {err}");
            None
        }
    }
}
