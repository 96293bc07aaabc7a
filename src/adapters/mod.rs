//! Device Adapter Framework (spec §4.1). A polymorphic protocol layer;
//! each variant satisfies the same seven-operation contract. Modeled as a
//! tagged enum wrapping per-protocol structs, per spec §9 ("Adapter
//! polymorphism").

pub mod ble;
pub mod bms_active;
pub mod bms_passive;
pub mod crc;
pub mod failover;
pub mod meter;
pub mod registers;
pub mod senergy;

use async_trait::async_trait;
use chrono_tz::Tz;

use crate::error::AdapterError;
use crate::telemetry::{BatteryBankTelemetry, InverterTelemetry, MeterTelemetry};

/// Normalized outcome of `handle_command` (spec §4.1).
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub ok: bool,
    pub detail: String,
}

/// Command descriptor accepted by `handle_command`. `write`/`write_many`
/// apply to inverter-family adapters; battery adapters currently accept
/// none of those (spec names no battery write actions). `ReadConfig` is a
/// read-only introspection request, not a write action — it surfaces
/// whatever configuration state an adapter has already decoded off the
/// wire rather than mutating anything.
#[derive(Debug, Clone)]
pub enum AdapterCommand {
    Write { id: String, value: i64 },
    WriteMany { updates: Vec<(String, i64)> },
    ReadConfig,
}

/// The uniform contract every adapter variant satisfies (spec §4.1 table).
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    async fn connect(&mut self) -> Result<(), AdapterError>;
    async fn close(&mut self);
    async fn check_connectivity(&mut self) -> bool;
    async fn read_serial_number(&mut self) -> Result<String, AdapterError>;
    async fn poll_inverter(&mut self, _tz: Tz) -> Result<InverterTelemetry, AdapterError> {
        Err(AdapterError::UnsupportedCommand("poll_inverter".into()))
    }
    async fn poll_battery(&mut self, _tz: Tz) -> Result<BatteryBankTelemetry, AdapterError> {
        Err(AdapterError::UnsupportedCommand("poll_battery".into()))
    }
    async fn poll_meter(&mut self, _tz: Tz) -> Result<MeterTelemetry, AdapterError> {
        Err(AdapterError::UnsupportedCommand("poll_meter".into()))
    }
    async fn handle_command(&mut self, command: AdapterCommand) -> Result<CommandOutcome, AdapterError>;
}

/// Probing timeout floors (spec §4.3 "Probing timeouts"): "these are
/// floors, not ceilings (an adapter may set lower values)".
#[derive(Debug, Clone, Copy)]
pub struct ProbeTimeouts {
    pub connect: std::time::Duration,
    pub operation: std::time::Duration,
}

impl ProbeTimeouts {
    pub const BATTERY: ProbeTimeouts = ProbeTimeouts {
        connect: std::time::Duration::from_secs(5),
        operation: std::time::Duration::from_secs(10),
    };
    pub const OTHER: ProbeTimeouts = ProbeTimeouts {
        connect: std::time::Duration::from_secs(3),
        operation: std::time::Duration::from_secs(5),
    };
}

/// Trims a decoded ASCII field at the first NUL (spec §4.1 item 1:
/// "trimmed at first NUL"), used by both the register-map ASCII decoder
/// and any adapter decoding serial/model strings.
pub fn trim_at_nul(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_ascii_at_first_nul() {
        assert_eq!(trim_at_nul(b"SN12345\0\0\0"), "SN12345");
        assert_eq!(trim_at_nul(b"  SN1\0"), "SN1");
    }
}
