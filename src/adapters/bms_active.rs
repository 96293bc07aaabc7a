//! BMS-Active adapter (spec §4.1 item 3). Unlike BMS-Passive, this variant
//! actively queries each battery by its Modbus unit address on a shared
//! RS-485 bus rather than sniffing a master's broadcasts. Register layout
//! mirrors the shared decoding table of spec §4.1 ("Frame decoding tables")
//! applied as holding registers instead of raw frame offsets, grounded on
//! the per-address polling loop in
//! `other_examples/cf364aad_charlieh0tel-renogy-rs__src-bin-renogy-bms-collector.rs.rs`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;

use crate::error::AdapterError;
use crate::telemetry::{BatteryBankTelemetry, BatteryCellRecord, BatteryUnitRecord};

use super::registers::decode_s32;
use super::{AdapterCommand, CommandOutcome, DeviceAdapter};

const CELL_COUNT: usize = 16;
const REG_CELL_VOLTAGE_BASE: u16 = 3; // mirrors status-frame cell table, addressed as registers
const REG_CELL_RESISTANCE_BASE: u16 = 43;
const REG_PACK_VOLTAGE: u16 = 120;
const REG_PACK_CURRENT: u16 = 82;
const REG_SOC: u16 = 90;
const REG_CYCLES: u16 = 94;
const REG_SOH: u16 = 98;
const REG_TEMPERATURE: u16 = 100;
const REG_STATUS_FLAGS: u16 = 102;

pub struct BmsActiveAdapter {
    serial_port: String,
    baudrate: u32,
    unit_addresses: Vec<u8>,
    bank_id: String,
    ctx: Option<Context>,
}

impl BmsActiveAdapter {
    pub fn new(serial_port: impl Into<String>, baudrate: u32, unit_addresses: Vec<u8>, bank_id: impl Into<String>) -> Self {
        Self {
            serial_port: serial_port.into(),
            baudrate,
            unit_addresses,
            bank_id: bank_id.into(),
            ctx: None,
        }
    }

    async fn attach(&mut self, unit: u8) -> Result<(), AdapterError> {
        let builder = tokio_serial::new(&self.serial_port, self.baudrate);
        let port = tokio_serial::SerialStream::open(&builder)
            .map_err(|e| AdapterError::TransportOpen(e.to_string()))?;
        self.ctx = Some(rtu::attach_slave(port, Slave(unit)));
        Ok(())
    }

    async fn read_holding(&mut self, addr: u16, count: u16) -> Result<Vec<u16>, AdapterError> {
        let ctx = self.ctx.as_mut().ok_or_else(|| AdapterError::TransportOpen("not connected".into()))?;
        match tokio::time::timeout(Duration::from_secs(5), ctx.read_holding_registers(addr, count)).await {
            Ok(Ok(Ok(words))) => Ok(words),
            Ok(Ok(Err(e))) => Err(AdapterError::TransportIo(e.to_string())),
            Ok(Err(e)) => Err(AdapterError::TransportIo(e.to_string())),
            Err(_) => Err(AdapterError::FrameTimeout),
        }
    }

    async fn poll_unit(&mut self, unit: u8) -> Result<(BatteryUnitRecord, Vec<BatteryCellRecord>), AdapterError> {
        self.attach(unit).await?;

        let cell_v = self.read_holding(REG_CELL_VOLTAGE_BASE, CELL_COUNT as u16).await?;
        let cell_r = self.read_holding(REG_CELL_RESISTANCE_BASE, CELL_COUNT as u16).await?;
        let cells: Vec<BatteryCellRecord> = cell_v
            .iter()
            .zip(cell_r.iter())
            .map(|(&v, &r)| BatteryCellRecord {
                voltage_v: v as f64 / 1000.0,
                resistance_mohm: r as f64 / 1000.0,
                balancing: false,
            })
            .collect();

        let pack_v = self.read_holding(REG_PACK_VOLTAGE, 1).await?;
        let pack_c = self.read_holding(REG_PACK_CURRENT, 2).await?;
        let soc = self.read_holding(REG_SOC, 1).await?;
        let cycles = self.read_holding(REG_CYCLES, 1).await?;
        let soh = self.read_holding(REG_SOH, 1).await?;
        let temp = self.read_holding(REG_TEMPERATURE, 1).await?;
        let flags = self.read_holding(REG_STATUS_FLAGS, 1).await?;

        let unit_record = BatteryUnitRecord {
            voltage_v: *pack_v.first().unwrap_or(&0) as f64 / 100.0,
            current_a: decode_s32(pack_c[0], pack_c[1]) as f64 / 1000.0,
            soc_pct: *soc.first().unwrap_or(&0) as u8,
            soh_pct: *soh.first().unwrap_or(&0) as u8,
            temperature_c: *temp.first().unwrap_or(&0) as f64 / 10.0,
            cycles: u32::from(*cycles.first().unwrap_or(&0)),
            status_flags: u32::from(*flags.first().unwrap_or(&0)),
        };
        Ok((unit_record, cells))
    }
}

#[async_trait]
impl DeviceAdapter for BmsActiveAdapter {
    async fn connect(&mut self) -> Result<(), AdapterError> {
        let first = *self.unit_addresses.first().ok_or_else(|| AdapterError::TransportOpen("no unit addresses configured".into()))?;
        self.attach(first).await
    }

    async fn close(&mut self) {
        self.ctx = None;
    }

    async fn check_connectivity(&mut self) -> bool {
        let Some(&unit) = self.unit_addresses.first() else { return false };
        if self.attach(unit).await.is_err() {
            return false;
        }
        self.read_holding(REG_SOC, 1).await.is_ok()
    }

    async fn read_serial_number(&mut self) -> Result<String, AdapterError> {
        Ok(String::new())
    }

    async fn poll_battery(&mut self, tz: Tz) -> Result<BatteryBankTelemetry, AdapterError> {
        let addresses = self.unit_addresses.clone();
        let mut units = Vec::with_capacity(addresses.len());
        let mut all_cells = Vec::with_capacity(addresses.len());
        let mut last_err = None;

        for &unit in &addresses {
            match self.poll_unit(unit).await {
                Ok((record, cells)) => {
                    units.push(record);
                    all_cells.push(cells);
                }
                Err(e) => last_err = Some(e),
            }
        }

        if units.is_empty() {
            return Err(last_err.unwrap_or(AdapterError::FrameTimeout));
        }

        let cells_per_battery = all_cells.first().map(|c| c.len() as u8).unwrap_or(0);
        let mut bank = crate::aggregation::aggregate_pack(&self.bank_id, Utc::now().with_timezone(&tz), &units, None);
        bank.cells_per_battery = cells_per_battery;
        bank.cells = Some(all_cells);
        Ok(bank)
    }

    async fn handle_command(&mut self, _command: AdapterCommand) -> Result<CommandOutcome, AdapterError> {
        Err(AdapterError::UnsupportedCommand("BMS-Active accepts no commands".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_offsets_are_disjoint() {
        let offsets = [
            REG_CELL_VOLTAGE_BASE,
            REG_CELL_RESISTANCE_BASE,
            REG_PACK_VOLTAGE,
            REG_PACK_CURRENT,
            REG_SOC,
            REG_CYCLES,
            REG_SOH,
            REG_TEMPERATURE,
            REG_STATUS_FLAGS,
        ];
        for (i, a) in offsets.iter().enumerate() {
            for (j, b) in offsets.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b);
                }
            }
        }
    }
}
