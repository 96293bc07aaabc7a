//! Recovery Manager (spec §4.4). Periodic tick (default every minute): any
//! device in `recovering` whose `next_retry_time` has passed gets one more
//! identification attempt, first on its last known port, then across all
//! free ports. Grounded on `solarhub/discovery/recovery.py`'s exponential
//! backoff formula.

use chrono::{Duration as ChronoDuration, Utc};

use crate::registry::{normalize_serial, DeviceRegistry, DeviceStatus};

use super::{identify_on_port, list_usb_ports, AdapterFactory};

pub struct RecoveryManager<'a> {
    registry: &'a mut DeviceRegistry,
    factory: &'a dyn AdapterFactory,
    initial_retry_minutes: u64,
    max_retry_minutes: u64,
    backoff_multiplier: f64,
    max_failures: u32,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(registry: &'a mut DeviceRegistry, factory: &'a dyn AdapterFactory, initial_retry_minutes: u64, max_retry_minutes: u64, backoff_multiplier: f64, max_failures: u32) -> Self {
        Self { registry, factory, initial_retry_minutes, max_retry_minutes, backoff_multiplier, max_failures }
    }

    /// `delay = initial_retry_minutes * backoff_multiplier^(failure_count-1)`,
    /// clamped to `max_retry_minutes` (spec §4.4).
    pub fn backoff_minutes(&self, failure_count: u32) -> u64 {
        let exponent = failure_count.saturating_sub(1) as i32;
        let delay = self.initial_retry_minutes as f64 * self.backoff_multiplier.powi(exponent);
        (delay.round() as u64).min(self.max_retry_minutes)
    }

    pub async fn tick(&mut self) {
        let now = Utc::now();
        let due: Vec<String> = self
            .registry
            .list_by_status(DeviceStatus::Recovering)
            .into_iter()
            .filter(|d| d.next_retry_time.map(|t| t <= now).unwrap_or(false))
            .map(|d| d.device_id.clone())
            .collect();

        for device_id in due {
            self.retry_device(&device_id).await;
        }
    }

    async fn retry_device(&mut self, device_id: &str) {
        let Some(entry) = self.registry.get(device_id) else { return };
        let adapter_type = entry.device_type.clone();
        let config = entry.adapter_config.clone();
        let expected_serial = entry.serial_number.clone();
        let last_port = entry.last_known_port.clone();

        if let Some(port) = &last_port {
            if let Some(serial) = identify_on_port(self.factory, &adapter_type, port, &config).await {
                if normalize_serial(&serial) == expected_serial {
                    self.registry.update_port(device_id, port.clone());
                    self.registry.mark_recovered(device_id);
                    return;
                }
            }
        }

        for port in list_usb_ports() {
            if Some(&port) == last_port.as_ref() {
                continue;
            }
            if let Some(serial) = identify_on_port(self.factory, &adapter_type, &port, &config).await {
                if normalize_serial(&serial) == expected_serial {
                    self.registry.update_port(device_id, port);
                    self.registry.mark_recovered(device_id);
                    return;
                }
            }
        }

        let failure_count = self.registry.get(device_id).map(|d| d.failure_count).unwrap_or(0) + 1;
        if failure_count >= self.max_failures {
            self.registry.permanently_disable(device_id);
            return;
        }
        let delay = self.backoff_minutes(failure_count);
        let next_retry = now_plus_minutes(delay);
        self.registry.mark_failed(device_id, next_retry);
    }
}

fn now_plus_minutes(minutes: u64) -> chrono::DateTime<Utc> {
    Utc::now() + ChronoDuration::minutes(minutes as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopFactory;
    impl AdapterFactory for NoopFactory {
        fn create(&self, _adapter_type: &str, _port: &str, _config: &serde_json::Value) -> Option<Box<dyn crate::adapters::DeviceAdapter>> {
            None
        }
        fn default_config(&self, _adapter_type: &str, _port: &str) -> serde_json::Value {
            serde_json::json!({})
        }
    }

    #[test]
    fn backoff_grows_exponentially_and_clamps() {
        let mut registry = DeviceRegistry::new();
        let factory = NoopFactory;
        let mgr = RecoveryManager::new(&mut registry, &factory, 1, 60, 2.0, 10);
        assert_eq!(mgr.backoff_minutes(1), 1);
        assert_eq!(mgr.backoff_minutes(2), 2);
        assert_eq!(mgr.backoff_minutes(3), 4);
        assert_eq!(mgr.backoff_minutes(10), 60);
    }

    #[tokio::test]
    async fn exceeding_max_failures_permanently_disables() {
        let mut registry = DeviceRegistry::new();
        registry.register_new("senergy", "SN-1234567890", "FAKE0".into(), serde_json::json!({}));
        let id = crate::registry::device_id_for("senergy", "SN-1234567890");
        for _ in 0..3 {
            registry.mark_failed(&id, Utc::now());
        }
        let factory = NoopFactory;
        let mut mgr = RecoveryManager::new(&mut registry, &factory, 1, 60, 2.0, 3);
        mgr.retry_device(&id).await;
        assert_eq!(registry.get(&id).unwrap().status, DeviceStatus::PermanentlyDisabled);
    }
}
