//! `FailoverBatteryAdapter` composite (spec §4.1 item 7). Wraps an ordered
//! list of concrete battery adapters; `connect` walks the list to the first
//! success, `poll` falls back to the next member on failure and returns
//! the last cached telemetry if all fail.

use async_trait::async_trait;
use chrono_tz::Tz;

use crate::error::AdapterError;
use crate::telemetry::BatteryBankTelemetry;

use super::{AdapterCommand, CommandOutcome, DeviceAdapter};

#[derive(Debug, Clone)]
pub struct CurrentAdapterInfo {
    pub index: usize,
    pub label: String,
    pub failover_count: u32,
}

pub struct FailoverBatteryAdapter {
    members: Vec<(String, Box<dyn DeviceAdapter>)>,
    active: usize,
    failover_count: u32,
    last_good: Option<BatteryBankTelemetry>,
}

impl FailoverBatteryAdapter {
    pub fn new(members: Vec<(String, Box<dyn DeviceAdapter>)>) -> Self {
        Self { members, active: 0, failover_count: 0, last_good: None }
    }

    pub fn current_adapter_info(&self) -> Option<CurrentAdapterInfo> {
        self.members.get(self.active).map(|(label, _)| CurrentAdapterInfo {
            index: self.active,
            label: label.clone(),
            failover_count: self.failover_count,
        })
    }

    fn advance(&mut self) {
        if !self.members.is_empty() {
            self.active = (self.active + 1) % self.members.len();
            self.failover_count += 1;
        }
    }
}

#[async_trait]
impl DeviceAdapter for FailoverBatteryAdapter {
    async fn connect(&mut self) -> Result<(), AdapterError> {
        let start = self.active;
        let len = self.members.len();
        if len == 0 {
            return Err(AdapterError::TransportOpen("no battery adapter members configured".into()));
        }
        for offset in 0..len {
            let idx = (start + offset) % len;
            if self.members[idx].1.connect().await.is_ok() {
                self.active = idx;
                return Ok(());
            }
        }
        Err(AdapterError::TransportOpen("all battery adapter members failed to connect".into()))
    }

    async fn close(&mut self) {
        for (_, adapter) in &mut self.members {
            adapter.close().await;
        }
    }

    async fn check_connectivity(&mut self) -> bool {
        match self.members.get_mut(self.active) {
            Some((_, adapter)) => adapter.check_connectivity().await,
            None => false,
        }
    }

    async fn read_serial_number(&mut self) -> Result<String, AdapterError> {
        match self.members.get_mut(self.active) {
            Some((_, adapter)) => adapter.read_serial_number().await,
            None => Err(AdapterError::IdentityUnavailable("no active member".into())),
        }
    }

    async fn poll_battery(&mut self, tz: Tz) -> Result<BatteryBankTelemetry, AdapterError> {
        if self.members.is_empty() {
            return Err(AdapterError::TransportOpen("no battery adapter members configured".into()));
        }
        for _ in 0..self.members.len() {
            let (_, adapter) = &mut self.members[self.active];
            match adapter.poll_battery(tz).await {
                Ok(telemetry) => {
                    self.last_good = Some(telemetry.clone());
                    return Ok(telemetry);
                }
                Err(_) => {
                    self.members[self.active].1.close().await;
                    self.advance();
                }
            }
        }
        self.last_good.clone().ok_or(AdapterError::FrameTimeout)
    }

    async fn handle_command(&mut self, _command: AdapterCommand) -> Result<CommandOutcome, AdapterError> {
        Err(AdapterError::UnsupportedCommand("failover battery adapter accepts no commands".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{BatteryBankTelemetry, BatteryUnitRecord};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlakyAdapter {
        label: &'static str,
        fail_times: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DeviceAdapter for FlakyAdapter {
        async fn connect(&mut self) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn close(&mut self) {}
        async fn check_connectivity(&mut self) -> bool {
            true
        }
        async fn read_serial_number(&mut self) -> Result<String, AdapterError> {
            Ok(self.label.to_string())
        }
        async fn poll_battery(&mut self, tz: Tz) -> Result<BatteryBankTelemetry, AdapterError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(AdapterError::FrameTimeout);
            }
            Ok(BatteryBankTelemetry {
                bank_id: self.label.to_string(),
                ts: chrono::Utc::now().with_timezone(&tz),
                voltage_v: 50.0,
                current_a: 0.0,
                temperature_c: 20.0,
                soc_pct: 80,
                batteries_count: 1,
                cells_per_battery: 0,
                units: vec![BatteryUnitRecord {
                    voltage_v: 50.0,
                    current_a: 0.0,
                    soc_pct: 80,
                    soh_pct: 100,
                    temperature_c: 20.0,
                    cycles: 0,
                    status_flags: 0,
                }],
                cells: None,
            })
        }
        async fn handle_command(&mut self, _command: AdapterCommand) -> Result<CommandOutcome, AdapterError> {
            Err(AdapterError::UnsupportedCommand("n/a".into()))
        }
    }

    #[tokio::test]
    async fn falls_back_to_next_member_on_failure() {
        let calls_a = Arc::new(AtomicUsize::new(0));
        let primary = FlakyAdapter { label: "primary", fail_times: 100, calls: calls_a };
        let calls_b = Arc::new(AtomicUsize::new(0));
        let backup = FlakyAdapter { label: "backup", fail_times: 0, calls: calls_b };

        let mut failover = FailoverBatteryAdapter::new(vec![
            ("primary".to_string(), Box::new(primary)),
            ("backup".to_string(), Box::new(backup)),
        ]);

        let telemetry = failover.poll_battery(chrono_tz::Tz::UTC).await.unwrap();
        assert_eq!(telemetry.bank_id, "backup");
        assert_eq!(failover.current_adapter_info().unwrap().label, "backup");
        assert_eq!(failover.current_adapter_info().unwrap().failover_count, 1);
    }

    #[tokio::test]
    async fn returns_last_cached_telemetry_when_all_fail() {
        let calls_a = Arc::new(AtomicUsize::new(0));
        let once_good = FlakyAdapter { label: "a", fail_times: 0, calls: calls_a };
        let mut failover = FailoverBatteryAdapter::new(vec![("a".to_string(), Box::new(once_good))]);

        let first = failover.poll_battery(chrono_tz::Tz::UTC).await.unwrap();
        assert_eq!(first.bank_id, "a");

        // Replace the member with one that always fails, but keep last_good.
        let calls_b = Arc::new(AtomicUsize::new(0));
        failover.members[0].1 = Box::new(FlakyAdapter { label: "a", fail_times: 100, calls: calls_b });
        let second = failover.poll_battery(chrono_tz::Tz::UTC).await.unwrap();
        assert_eq!(second.bank_id, "a");
    }
}
