//! Process entry point (SPEC_FULL.md §A): loads configuration and the
//! hierarchy, validates the hierarchy fatally (spec §7 "Structural"),
//! constructs every adapter named in the hierarchy through a single
//! `AdapterFactory` implementation, optionally runs a discovery scan, then
//! hands everything to the `Orchestrator` and runs until terminated.

mod adapters;
mod aggregation;
mod bus;
mod config;
mod discovery;
mod energy;
mod error;
mod hierarchy;
mod orchestrator;
mod queue;
mod registry;
mod scheduler;
mod store;
mod telemetry;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::Mutex;

use adapters::ble::BleAdapter;
use adapters::bms_active::BmsActiveAdapter;
use adapters::bms_passive::{BmsPassiveAdapter, PassiveSource};
use adapters::failover::FailoverBatteryAdapter;
use adapters::meter::MeterAdapter;
use adapters::registers::RegisterMap;
use adapters::senergy::{SenergyAdapter, SenergyTransport};
use adapters::DeviceAdapter;
use bus::{topics, to_payload, Bus, MqttBus};
use config::Config;
use discovery::discoverer::Discoverer;
use discovery::recovery::RecoveryManager;
use discovery::AdapterFactory;
use error::{ConfigError, HubError};
use orchestrator::Orchestrator;
use queue::{AdapterHandle, CommandAction, ConfigHandler, InverterCommand};
use scheduler::{Forecast, ForecastProvider};

/// Every concrete `DeviceAdapter` variant this crate ships (spec §4.1),
/// constructed from the opaque `adapter_config` blob an `Inverter`/`Meter`
/// or `AdapterInstance` carries. This is the one place that knows about
/// every variant, per `discovery/mod.rs`'s `AdapterFactory` doc comment.
struct HubAdapterFactory;

fn str_field<'a>(config: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    config.get(key)?.as_str()
}

fn u64_field(config: &serde_json::Value, key: &str, default: u64) -> u64 {
    config.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
}

fn bool_field(config: &serde_json::Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

impl AdapterFactory for HubAdapterFactory {
    fn create(&self, adapter_type: &str, port: &str, config: &serde_json::Value) -> Option<Box<dyn DeviceAdapter>> {
        match adapter_type {
            "senergy_rtu" => {
                let register_map_path = str_field(config, "register_map_path")?;
                let register_map = RegisterMap::load(register_map_path).ok()?;
                let array_id = str_field(config, "array_id")?;
                let unit_id = u64_field(config, "unit_id", 1) as u8;
                let baudrate = u64_field(config, "baudrate", 9600) as u32;
                let transport = SenergyTransport::Rtu { serial_port: port.to_string(), unit_id, baudrate };
                Some(Box::new(SenergyAdapter::new(transport, register_map, array_id)))
            }
            "senergy_tcp" => {
                let register_map_path = str_field(config, "register_map_path")?;
                let register_map = RegisterMap::load(register_map_path).ok()?;
                let array_id = str_field(config, "array_id")?;
                let unit_id = u64_field(config, "unit_id", 1) as u8;
                let addr = SocketAddr::from_str(str_field(config, "addr")?).ok()?;
                let transport = SenergyTransport::Tcp { addr, unit_id };
                Some(Box::new(SenergyAdapter::new(transport, register_map, array_id)))
            }
            "meter" => {
                let addr = SocketAddr::from_str(str_field(config, "addr")?).ok()?;
                let unit_id = u64_field(config, "unit_id", 1) as u8;
                let meter_id = str_field(config, "meter_id")?;
                let prefer_legacy = bool_field(config, "prefer_legacy_registers", false);
                Some(Box::new(MeterAdapter::new(addr, unit_id, meter_id, prefer_legacy)))
            }
            "bms_active" => {
                let bank_id = str_field(config, "bank_id")?;
                let baudrate = u64_field(config, "baudrate", 9600) as u32;
                let unit_addresses: Vec<u8> = config
                    .get("unit_addresses")?
                    .as_array()?
                    .iter()
                    .filter_map(|v| v.as_u64().map(|n| n as u8))
                    .collect();
                Some(Box::new(BmsActiveAdapter::new(port, baudrate, unit_addresses, bank_id)))
            }
            "bms_passive" => {
                let bank_id = str_field(config, "bank_id")?;
                let baudrate = u64_field(config, "baudrate", 9600) as u32;
                let wrap = bool_field(config, "wrap_id_15_to_0", false);
                let source = PassiveSource::Serial { port: port.to_string(), baudrate };
                Some(Box::new(BmsPassiveAdapter::new(source, bank_id, wrap)))
            }
            "bms_tcp" => {
                let bank_id = str_field(config, "bank_id")?;
                let wrap = bool_field(config, "wrap_id_15_to_0", false);
                let addr = SocketAddr::from_str(port).ok()?;
                let source = PassiveSource::Tcp { addr };
                Some(Box::new(BmsPassiveAdapter::new(source, bank_id, wrap)))
            }
            "ble" => {
                let bank_id = str_field(config, "bank_id")?;
                let adapter_name = str_field(config, "adapter_name").unwrap_or("default");
                Some(Box::new(BleAdapter::new(port, bank_id, adapter_name)))
            }
            _ => None,
        }
    }

    fn default_config(&self, adapter_type: &str, port: &str) -> serde_json::Value {
        match adapter_type {
            "meter" => serde_json::json!({"addr": port, "unit_id": 1, "meter_id": "meter_new", "prefer_legacy_registers": false}),
            "bms_active" => serde_json::json!({"bank_id": "bank_new", "baudrate": 9600, "unit_addresses": [1]}),
            "bms_passive" | "bms_tcp" => serde_json::json!({"bank_id": "bank_new", "baudrate": 9600, "wrap_id_15_to_0": false}),
            "ble" => serde_json::json!({"bank_id": "bank_new", "adapter_name": "default"}),
            _ => serde_json::json!({"array_id": "array_new", "unit_id": 1, "baudrate": 9600, "register_map_path": "register_maps/senergy.json"}),
        }
    }
}

/// Overlays the device registry's corrected port/address onto an entity's
/// own `adapter_config`/`AdapterInstance::config` blob (spec §4.3: a
/// startup discovery scan that finds a device on a different port than the
/// hierarchy file records must actually open it there). Matched by
/// `(adapter_type, serial_number)` — `config` carries its own
/// `serial_number` key, the same value the registry normalizes and keys
/// `DeviceEntry`s by; entities with no `serial_number` key, or with no
/// matching registry entry, or whose registry entry has no corrected port
/// yet, are returned unchanged. Overlays whichever of `port`/`addr` the
/// config already uses, since RTU/BLE-family adapters key on `port` and
/// TCP-family/meter adapters key on `addr`.
fn resolve_adapter_config(registry: &registry::DeviceRegistry, adapter_type: &str, config: &serde_json::Value) -> serde_json::Value {
    let Some(serial) = str_field(config, "serial_number") else {
        return config.clone();
    };
    let device_id = registry::device_id_for(adapter_type, serial);
    let Some(port) = registry.get(&device_id).and_then(|entry| entry.port.clone()) else {
        return config.clone();
    };
    let mut updated = config.clone();
    if let Some(obj) = updated.as_object_mut() {
        if obj.contains_key("port") {
            obj.insert("port".to_string(), serde_json::Value::String(port));
        } else if obj.contains_key("addr") {
            obj.insert("addr".to_string(), serde_json::Value::String(port));
        }
    }
    updated
}

/// Builds the one adapter a `BatteryPack`'s ranked `AdapterInstance`s
/// describe, wrapping more than one enabled adapter in a
/// `FailoverBatteryAdapter` (spec §4.1 item 7, spec §3 "failover").
fn build_pack_adapter(factory: &HubAdapterFactory, pack: &hierarchy::BatteryPack, registry: &registry::DeviceRegistry) -> Option<Box<dyn DeviceAdapter>> {
    let mut enabled: Vec<&hierarchy::AdapterInstance> = pack.adapters.iter().filter(|a| a.enabled).collect();
    enabled.sort_by_key(|a| a.priority);
    if enabled.is_empty() {
        error!("battery pack {} has no enabled adapter, skipping", pack.pack_id);
        return None;
    }
    if enabled.len() == 1 {
        let inst = enabled[0];
        let config = resolve_adapter_config(registry, &inst.adapter_type, &inst.config);
        let port = str_field(&config, "port").unwrap_or_default();
        return factory.create(&inst.adapter_type, port, &config);
    }
    let members: Vec<(String, Box<dyn DeviceAdapter>)> = enabled
        .into_iter()
        .filter_map(|inst| {
            let config = resolve_adapter_config(registry, &inst.adapter_type, &inst.config);
            let port = str_field(&config, "port").unwrap_or_default();
            factory.create(&inst.adapter_type, port, &config).map(|a| (inst.adapter_type.clone(), a))
        })
        .collect();
    if members.is_empty() {
        return None;
    }
    Some(Box::new(FailoverBatteryAdapter::new(members)))
}

/// Stand-in forecast provider: the scheduler needs a value to consume
/// (spec §4.8), but weather-forecast providers are named-interface-only
/// (spec §1 Non-goals). Returns a flat zero forecast so `SmartScheduler`
/// degrades to its no-grid-charge-needed path until a real provider is
/// wired in through this same trait.
struct NullForecastProvider;

impl ForecastProvider for NullForecastProvider {
    fn forecast(&self, _array_id: &str) -> Forecast {
        Forecast { today_kwh: 0.0, tomorrow_kwh: 0.0, sunrise_minute: 6 * 60, sunset_minute: 18 * 60 }
    }
}

/// Builds the `InverterConfig` config-handler the queue worker calls for
/// scheduler-originated writes (spec §4.5's `inverter_config` action):
/// routes through the same adapter map the orchestrator polls, via
/// `handle_command`'s `Write` variant keyed by sensor id instead of a raw
/// register address, since every adapter already resolves ids through its
/// register map.
fn build_config_handler(inverter_adapters: HashMap<String, AdapterHandle>) -> ConfigHandler {
    Arc::new(move |inverter_id, sensor_id, value| {
        let Some(adapter) = inverter_adapters.get(inverter_id) else {
            return Err(error::QueueError::UnknownInverter(inverter_id.to_string()));
        };
        let Some(int_value) = value.as_i64().or_else(|| value.as_f64().map(|f| f.round() as i64)).or_else(|| value.as_bool().map(|b| b as i64)) else {
            return Err(error::QueueError::CommandFailed(format!("non-numeric value for {sensor_id}")));
        };
        let adapter = adapter.clone();
        let sensor_id = sensor_id.to_string();
        tokio::spawn(async move {
            let mut guard = adapter.lock().await;
            if let Err(err) = guard.handle_command(adapters::AdapterCommand::Write { id: sensor_id.clone(), value: int_value }).await {
                warn!("scheduler write {sensor_id} failed: {err}");
            }
        });
        Ok(())
    })
}

/// Enqueues `action` for `inverter_id` and publishes the matching `ack`
/// (spec §6 topic table) once the queue worker reports the outcome.
fn enqueue_with_ack(bus: Arc<dyn Bus>, ack_topic: String, queue: queue::QueueHandle, inverter_id: String, action: CommandAction, max_retries: u32) {
    tokio::spawn(async move {
        let ack_topic_cb = ack_topic.clone();
        let inverter_id_cb = inverter_id.clone();
        let callback: queue::CommandCallback = Box::new(move |outcome| {
            let payload = match &outcome {
                Ok(()) => serde_json::json!({"ok": true, "detail": ""}),
                Err(err) => serde_json::json!({"ok": false, "detail": err.to_string()}),
            };
            tokio::spawn(async move {
                if let Err(err) = bus.publish(&ack_topic_cb, payload, false).await {
                    warn!("publish ack for {inverter_id_cb} failed: {err}");
                }
            });
        });
        let mut command = InverterCommand::new(inverter_id.clone(), action).with_max_retries(max_retries);
        command.callback = Some(callback);
        if let Err(err) = queue.enqueue(command).await {
            warn!("enqueue command for {inverter_id} failed: {err}");
        }
    });
}

/// Subscribes to every inbound command topic the hierarchy's inverters
/// expose (spec §6 topic table: `cmd`, `write`, `write_many`,
/// `config/{sensor_id}/set`), routing each into the shared `CommandQueue`.
async fn subscribe_inverter_commands(bus: &Arc<dyn Bus>, base_topic: &str, inverter_id: &str, queue: queue::QueueHandle, max_retries: u32) -> Result<(), error::BusError> {
    let ack_topic = topics::inverter_ack(base_topic, inverter_id);

    for (topic, shorthand) in [
        (topics::inverter_cmd(base_topic, inverter_id), None),
        (topics::inverter_write(base_topic, inverter_id), Some("write")),
        (topics::inverter_write_many(base_topic, inverter_id), Some("write_many")),
    ] {
        let bus_ack = bus.clone();
        let ack_topic = ack_topic.clone();
        let queue = queue.clone();
        let inverter_id = inverter_id.to_string();
        bus.subscribe(
            &topic,
            Arc::new(move |_topic, payload| {
                let Ok(body) = serde_json::from_slice::<serde_json::Value>(payload) else { return };
                let action_name = shorthand.map(|s| s.to_string()).or_else(|| body.get("action").and_then(|v| v.as_str()).map(str::to_string));
                let Some(action_name) = action_name else { return };
                let Some(action) = bus::parse_command_payload(&action_name, &body) else { return };
                enqueue_with_ack(bus_ack.clone(), ack_topic.clone(), queue.clone(), inverter_id.clone(), action, max_retries);
            }),
        )
        .await?;
    }

    let config_pattern = topics::inverter_config_set_pattern(base_topic, inverter_id);
    let prefix = format!("{base_topic}/{inverter_id}/config/");
    let bus_ack = bus.clone();
    let ack_topic = ack_topic.clone();
    let queue = queue.clone();
    let inverter_id = inverter_id.to_string();
    bus.subscribe(
        &config_pattern,
        Arc::new(move |topic, payload| {
            let Some(rest) = topic.strip_prefix(&prefix) else { return };
            let Some(sensor_id) = rest.strip_suffix("/set") else { return };
            let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) else { return };
            let action = bus::config_set_action(sensor_id, value);
            enqueue_with_ack(bus_ack.clone(), ack_topic.clone(), queue.clone(), inverter_id.clone(), action, max_retries);
        }),
    )
    .await?;

    Ok(())
}

async fn run() -> Result<(), HubError> {
    env_logger::init();

    let config = Config::load("config.json").map_err(HubError::Config)?;
    let tz: chrono_tz::Tz = config.timezone.parse().map_err(|_| HubError::Config(ConfigError::InvalidTimezone(config.timezone.clone())))?;
    let hier = hierarchy::load("hierarchy.json").map_err(HubError::Config)?;
    hierarchy::validate(&hier).map_err(HubError::Hierarchy)?;
    info!(
        "loaded hierarchy: {} systems, {} inverter arrays, {} battery arrays, {} inverters, {} packs, {} meters",
        hier.systems.len(),
        hier.inverter_arrays.len(),
        hier.battery_arrays.len(),
        hier.inverters.len(),
        hier.packs.len(),
        hier.meters.len()
    );

    let factory = HubAdapterFactory;

    // Loaded unconditionally (spec §3 "Persistent table"): a device that
    // hit `max_failures` on a previous run must stay `permanently_disabled`
    // even if this run has discovery disabled. Missing file just means
    // first boot.
    let mut registry = registry::DeviceRegistry::load("registry.json").unwrap_or_else(|err| {
        error!("failed to load device registry, starting empty: {err}");
        registry::DeviceRegistry::new()
    });

    if config.discovery.enabled && config.discovery.scan_on_startup {
        let mut discoverer = Discoverer::new(&mut registry, &factory, config.discovery.priority_order.clone(), config.discovery.initial_retry_minutes, config.discovery.max_failures);
        discoverer.run().await;
        info!("startup discovery scan complete: {} known devices", registry.get_all().len());
        if let Err(err) = registry.save("registry.json") {
            warn!("failed to save device registry after startup scan: {err}");
        }
    }

    // Adapters are constructed from the hierarchy's own per-entity config,
    // with any port the registry has since corrected for that device
    // overlaid first (spec §4.3) — so a device the scan above found on a
    // new port is actually opened there instead of the hierarchy's stale
    // one.
    let mut inverter_adapters: HashMap<String, AdapterHandle> = HashMap::new();
    for inv in &hier.inverters {
        let config = resolve_adapter_config(&registry, &inv.adapter_type, &inv.adapter_config);
        let port = str_field(&config, "port").unwrap_or_default();
        match factory.create(&inv.adapter_type, port, &config) {
            Some(adapter) => {
                inverter_adapters.insert(inv.inverter_id.clone(), Arc::new(Mutex::new(adapter)));
            }
            None => error!("failed to construct adapter for inverter {}", inv.inverter_id),
        }
    }

    let mut battery_adapters: HashMap<String, AdapterHandle> = HashMap::new();
    for pack in &hier.packs {
        if let Some(adapter) = build_pack_adapter(&factory, pack, &registry) {
            battery_adapters.insert(pack.pack_id.clone(), Arc::new(Mutex::new(adapter)));
        }
    }

    let mut meter_adapters: HashMap<String, AdapterHandle> = HashMap::new();
    for meter in &hier.meters {
        let config = resolve_adapter_config(&registry, "meter", &meter.adapter_config);
        let addr = str_field(&config, "addr").unwrap_or_default();
        match factory.create("meter", addr, &config) {
            Some(adapter) => {
                meter_adapters.insert(meter.meter_id.clone(), Arc::new(Mutex::new(adapter)));
            }
            None => error!("failed to construct adapter for meter {}", meter.meter_id),
        }
    }

    // RecoveryManager keeps running the same identification procedure on a
    // timer against the registry the adapters above were just built from
    // (spec §4.4); port corrections it finds take effect the next time this
    // process restarts and re-resolves adapter configs above, and its own
    // bookkeeping (SPEC_FULL.md §C `devices_needing_attention`) is
    // persisted after every tick.
    if config.discovery.enabled {
        let discovery_cfg = config.discovery.clone();
        tokio::spawn(async move {
            let mut registry = registry;
            let factory = HubAdapterFactory;
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                let mut mgr = RecoveryManager::new(
                    &mut registry,
                    &factory,
                    discovery_cfg.initial_retry_minutes,
                    discovery_cfg.max_retry_minutes,
                    discovery_cfg.backoff_multiplier,
                    discovery_cfg.max_failures,
                );
                mgr.tick().await;
                if let Err(err) = registry.save("registry.json") {
                    warn!("failed to save device registry after recovery tick: {err}");
                }
            }
        });
    }

    let bus: Arc<dyn Bus> = Arc::new(MqttBus::connect(&config.bus).await);
    for inv in &hier.inverters {
        let topic = topics::availability(&config.bus.base_topic, &inv.inverter_id);
        if let Err(err) = bus.publish(&topic, to_payload(&"online"), true).await {
            warn!("availability publish failed for {}: {err}", inv.inverter_id);
        }
    }

    let config_handler = build_config_handler(inverter_adapters.clone());
    let forecast: Arc<dyn ForecastProvider> = Arc::new(NullForecastProvider);

    let mut orchestrator = Orchestrator::new(
        config.clone(),
        tz,
        hier.clone(),
        bus.clone(),
        None,
        forecast,
        inverter_adapters,
        battery_adapters,
        meter_adapters,
        config_handler,
    );

    let queue_handle = orchestrator.command_queue_handle();
    for inv in &hier.inverters {
        if let Err(err) = subscribe_inverter_commands(&bus, &config.bus.base_topic, &inv.inverter_id, queue_handle.clone(), config.queue.max_retries).await {
            warn!("subscribe for {} failed: {err}", inv.inverter_id);
        }
    }

    orchestrator.run().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("fatal: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
