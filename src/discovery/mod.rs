//! Discovery & Recovery Engine (spec §4.3, §4.4). Both `Discoverer` and
//! `RecoveryManager` share the same on-port identification procedure and
//! the same notion of an adapter factory, since neither module knows how
//! to construct a concrete `DeviceAdapter` variant from a device type
//! string — that's supplied by the caller (`main.rs`), which does know
//! about every variant in `adapters/`.

pub mod discoverer;
pub mod recovery;

use std::time::Duration;

use crate::adapters::{DeviceAdapter, ProbeTimeouts};

/// Constructs a concrete adapter for a `(device_type, port, config)` triple.
/// Implemented once in `main.rs` where every adapter variant is in scope;
/// kept as a trait here so discovery stays decoupled from the variant set
/// (spec §9 "Adapter polymorphism").
pub trait AdapterFactory: Send + Sync {
    fn create(&self, adapter_type: &str, port: &str, config: &serde_json::Value) -> Option<Box<dyn DeviceAdapter>>;

    /// A reasonable default config for a type with no prior registry entry,
    /// used by discovery phase 3 ("try each adapter type in the configured
    /// `priority_order` with a default config per type").
    fn default_config(&self, adapter_type: &str, port: &str) -> serde_json::Value;
}

fn timeouts_for(adapter_type: &str) -> ProbeTimeouts {
    if adapter_type.contains("bms") || adapter_type.contains("battery") {
        ProbeTimeouts::BATTERY
    } else {
        ProbeTimeouts::OTHER
    }
}

/// Identification procedure on a port (spec §4.3): open bounded by
/// `connect`, `check_connectivity` bounded by `operation`, then
/// `read_serial_number`. Regardless of outcome, closes the adapter and
/// waits 0.5s before returning, so the OS releases the port before the
/// runtime claims it.
async fn identify_on_port(factory: &dyn AdapterFactory, adapter_type: &str, port: &str, config: &serde_json::Value) -> Option<String> {
    let Some(mut adapter) = factory.create(adapter_type, port, config) else {
        return None;
    };
    let timeouts = timeouts_for(adapter_type);

    let serial = async {
        match tokio::time::timeout(timeouts.connect, adapter.connect()).await {
            Ok(Ok(())) => {}
            _ => return None,
        }
        match tokio::time::timeout(timeouts.operation, adapter.check_connectivity()).await {
            Ok(true) => {}
            _ => return None,
        }
        match tokio::time::timeout(timeouts.operation, adapter.read_serial_number()).await {
            Ok(Ok(serial)) => {
                let trimmed = serial.trim().to_string();
                if trimmed.chars().count() >= 3 {
                    Some(trimmed)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
    .await;

    adapter.close().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    serial
}

/// USB-class serial ports currently present on the host (spec §4.3 phase 2:
/// "only USB-class ports; `/dev/ttyUSB*` or `COM*`").
fn list_usb_ports() -> Vec<String> {
    tokio_serial::available_ports()
        .unwrap_or_default()
        .into_iter()
        .filter(|p| matches!(p.port_type, tokio_serial::SerialPortType::UsbPort(_)))
        .map(|p| p.port_name)
        .collect()
}
