//! Message-broker client (spec §6 "Bus"). The core depends only on the
//! `Bus` trait; `MqttBus` is the runtime implementation over `rumqttc`,
//! grounded on the teacher's `services/mqtt_service.rs` (single
//! `AsyncClient` plus a task draining its `EventLoop`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::config::BusConfig;
use crate::error::BusError;

/// Invoked with `(topic, payload_bytes)` for every message matching a
/// registered subscription pattern.
pub type BusHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value, retain: bool) -> Result<(), BusError>;
    async fn subscribe(&self, topic_pattern: &str, handler: BusHandler) -> Result<(), BusError>;
}

/// `rumqttc`-backed `Bus`. The event loop is drained by a background task
/// spawned from `connect`; incoming publishes are matched against
/// registered patterns using standard MQTT wildcard rules (`+`, `#`).
pub struct MqttBus {
    client: AsyncClient,
    handlers: Arc<Mutex<Vec<(String, BusHandler)>>>,
}

impl MqttBus {
    /// Opens the connection and starts the background poll loop. Mirrors
    /// the teacher's birth-message pattern: a retained `online`/`offline`
    /// status is the caller's responsibility per device (spec §6
    /// `{base}/{inverter_id}/availability`), not a single fleet-wide one.
    pub async fn connect(cfg: &BusConfig) -> Self {
        let client_id = if cfg.client_id.is_empty() { format!("solar-hub-{}", uuid::Uuid::new_v4()) } else { cfg.client_id.clone() };
        let mut opts = MqttOptions::new(client_id, &cfg.broker_host, cfg.broker_port);
        opts.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            opts.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(opts, 256);
        let handlers: Arc<Mutex<Vec<(String, BusHandler)>>> = Arc::new(Mutex::new(Vec::new()));
        let handlers_task = handlers.clone();

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let guard = handlers_task.lock().await;
                        for (pattern, handler) in guard.iter() {
                            if topic_matches(pattern, &publish.topic) {
                                handler(&publish.topic, &publish.payload);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        log::warn!("mqtt event loop error: {err}, retrying");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self { client, handlers }
    }
}

#[async_trait]
impl Bus for MqttBus {
    async fn publish(&self, topic: &str, payload: Value, retain: bool) -> Result<(), BusError> {
        let body = payload.to_string();
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, body.into_bytes())
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(&self, topic_pattern: &str, handler: BusHandler) -> Result<(), BusError> {
        self.client
            .subscribe(topic_pattern, QoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        self.handlers.lock().await.push((topic_pattern.to_string(), handler));
        Ok(())
    }
}

/// MQTT topic-filter matching: `+` matches exactly one level, `#` (only
/// valid as the final level) matches the remainder.
fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut p = pattern.split('/');
    let mut t = topic.split('/');
    loop {
        match (p.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(a), Some(b)) if a == b => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Flattens a serializable telemetry value into the payload shape spec §6
/// requires: the `extra` map's keys merged into the top level, and
/// recursion capped so a pathologically deep value degrades to a marker
/// string instead of overflowing the stack — the practical stand-in for
/// "cycles are replaced with `<circular reference>`" in a representation
/// that, built from this crate's own types, cannot actually contain a
/// cycle. (NaN/Infinity floats never reach here as numbers at all:
/// `serde_json::to_value` already coerces them to `null` per its own
/// `Number::from_f64` contract, which is the "non-serializable value"
/// coercion this crate relies on for that case.)
pub fn to_payload<T: serde::Serialize>(value: &T) -> Value {
    let raw = match serde_json::to_value(value) {
        Ok(v) => v,
        Err(e) => return Value::String(format!("<unserializable: {e}>")),
    };
    let sanitized = cap_depth(&raw, 0);
    flatten_extra(sanitized)
}

const MAX_DEPTH: usize = 32;

fn cap_depth(value: &Value, depth: usize) -> Value {
    if depth > MAX_DEPTH {
        return Value::String("<circular reference>".to_string());
    }
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), cap_depth(v, depth + 1));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| cap_depth(v, depth + 1)).collect()),
        other => other.clone(),
    }
}

fn flatten_extra(value: Value) -> Value {
    let Value::Object(mut map) = value else { return value };
    if let Some(Value::Object(extra)) = map.remove("extra") {
        for (k, v) in extra {
            map.entry(k).or_insert(v);
        }
    }
    Value::Object(map)
}

/// Parses an inbound `cmd`/`write`/`write_many` payload into a
/// `CommandAction` (spec §6 topic table). Returns `None` for malformed
/// payloads, which the caller logs and drops.
pub fn parse_command_payload(action: &str, body: &Value) -> Option<crate::queue::CommandAction> {
    match action {
        "write" => {
            let id = body.get("id")?.as_str()?.to_string();
            let value = body.get("value")?.as_i64()?;
            Some(crate::queue::CommandAction::Write { id, value })
        }
        "write_many" => {
            let updates = body
                .get("updates")?
                .as_array()?
                .iter()
                .filter_map(|u| Some((u.get("id")?.as_str()?.to_string(), u.get("value")?.as_i64()?)))
                .collect::<Vec<_>>();
            Some(crate::queue::CommandAction::WriteMany { updates })
        }
        _ => None,
    }
}

/// Maps `(inverter_id, sensor_id, value)` from a `config/{sensor_id}/set`
/// topic into the `InverterConfig` queue action.
pub fn config_set_action(sensor_id: &str, value: Value) -> crate::queue::CommandAction {
    crate::queue::CommandAction::InverterConfig { sensor_id: sensor_id.to_string(), value }
}

/// Canonical topic builders, kept in one place so the orchestrator and the
/// command-inbound router never drift apart (spec §6 topic table).
pub mod topics {
    pub fn availability(base: &str, inverter_id: &str) -> String {
        format!("{base}/{inverter_id}/availability")
    }
    pub fn inverter_regs(base: &str, inverter_id: &str) -> String {
        format!("{base}/{inverter_id}/regs")
    }
    pub fn inverter_cmd(base: &str, inverter_id: &str) -> String {
        format!("{base}/{inverter_id}/cmd")
    }
    pub fn inverter_write(base: &str, inverter_id: &str) -> String {
        format!("{base}/{inverter_id}/write")
    }
    pub fn inverter_write_many(base: &str, inverter_id: &str) -> String {
        format!("{base}/{inverter_id}/write_many")
    }
    pub fn inverter_ack(base: &str, inverter_id: &str) -> String {
        format!("{base}/{inverter_id}/ack")
    }
    pub fn inverter_config_set_pattern(base: &str, inverter_id: &str) -> String {
        format!("{base}/{inverter_id}/config/+/set")
    }
    pub fn battery_bank_regs(base: &str, bank_id: &str) -> String {
        format!("{base}/battery/{bank_id}/regs")
    }
    pub fn battery_unit_regs(base: &str, bank_id: &str, unit: usize) -> String {
        format!("{base}/battery/{bank_id}/{unit}/regs")
    }
    pub fn battery_cell_regs(base: &str, bank_id: &str, unit: usize, idx: usize) -> String {
        format!("{base}/battery/{bank_id}/{unit}/cells/{idx}/regs")
    }
    pub fn array_state(base: &str, array_id: &str) -> String {
        format!("{base}/arrays/{array_id}/state")
    }
    pub fn system_state(base: &str, system_id: &str) -> String {
        format!("{base}/systems/{system_id}/state")
    }
    pub fn meter_regs(base: &str, meter_id: &str) -> String {
        format!("{base}/meter/{meter_id}/regs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_extra_into_top_level() {
        let mut extra = Map::new();
        extra.insert("vendor_code".into(), json!(7));
        let mut obj = Map::new();
        obj.insert("pv_power_w".into(), json!(1000.0));
        obj.insert("extra".into(), Value::Object(extra));
        let flattened = flatten_extra(Value::Object(obj));
        assert_eq!(flattened["vendor_code"], json!(7));
        assert_eq!(flattened["pv_power_w"], json!(1000.0));
        assert!(flattened.get("extra").is_none());
    }

    #[test]
    fn non_finite_floats_become_null_via_serde_json_itself() {
        #[derive(serde::Serialize)]
        struct S {
            a: f64,
        }
        let value = to_payload(&S { a: f64::INFINITY });
        assert_eq!(value["a"], Value::Null);
    }

    #[test]
    fn topic_wildcard_matching() {
        assert!(topic_matches("solarhub/+/regs", "solarhub/inv1/regs"));
        assert!(topic_matches("solarhub/inv1/config/+/set", "solarhub/inv1/config/max_power/set"));
        assert!(topic_matches("solarhub/#", "solarhub/inv1/cmd"));
        assert!(!topic_matches("solarhub/+/regs", "solarhub/inv1/ack"));
    }

    #[test]
    fn parses_write_and_write_many_payloads() {
        let write = parse_command_payload("write", &json!({"id": "max_power", "value": 100})).unwrap();
        assert!(matches!(write, crate::queue::CommandAction::Write { .. }));
        let many = parse_command_payload(
            "write_many",
            &json!({"updates": [{"id": "a", "value": 1}, {"id": "b", "value": 2}]}),
        )
        .unwrap();
        assert!(matches!(many, crate::queue::CommandAction::WriteMany { .. }));
    }
}
