//! BMS-Passive RS-485 sniffer, and by extension BMS-TCP gateway — spec §4.1
//! items 4-5 share this decoder, differing only in byte source. Grounded on
//! `jkbms_monitor.py`'s frame scanner (`find_next_frame_start`,
//! `parse_modbus_frame`, `parse_frame_type_01`/`02`) and
//! `test_jkbms_passive.py` / `test_jkbms_tcpip.py`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::AdapterError;
use crate::telemetry::{BatteryBankTelemetry, BatteryCellRecord, BatteryUnitRecord};

use super::crc::modbus_crc16;
use super::{AdapterCommand, CommandOutcome, DeviceAdapter};

const DATA_FRAME_START: [u8; 4] = [0x55, 0xAA, 0xEB, 0x90];
const MODBUS_PATTERN: [u8; 2] = [0x10, 0x16];
const MODBUS_REQUEST_FN: u8 = 0x20;
const FRAME_TYPE_CONFIG: u8 = 0x01;
const FRAME_TYPE_STATUS: u8 = 0x02;
const MAX_MODBUS_FRAME_LEN: usize = 512;
const CELL_COUNT: usize = 16;
const RECV_CHUNK: usize = 4096;

#[derive(Debug, Clone, Default)]
struct PassiveBatteryRecord {
    cells: Vec<BatteryCellRecord>,
    pack_voltage_v: f64,
    pack_current_a: f64,
    soc_pct: u8,
    soh_pct: u8,
    cycles: u32,
    status_flags: u32,
}

#[derive(Default)]
struct PassiveState {
    current_battery: Option<u8>,
    records: HashMap<u8, PassiveBatteryRecord>,
    configs: HashMap<u8, HashMap<String, f64>>,
}

pub enum PassiveSource {
    Serial { port: String, baudrate: u32 },
    Tcp { addr: std::net::SocketAddr },
}

/// Shared implementation for BMS-Passive and BMS-TCP (spec §4.1 item 5:
/// "Same framing as BMS-Passive but the byte source is a TCP socket").
pub struct BmsPassiveAdapter {
    source: PassiveSource,
    bank_id: String,
    /// Work around a known master quirk: battery id 15 wraps to 0 (spec
    /// §4.1 item 4).
    wrap_id_15_to_0: bool,
    state: Arc<Mutex<PassiveState>>,
    reader_task: Option<JoinHandle<()>>,
}

impl BmsPassiveAdapter {
    pub fn new(source: PassiveSource, bank_id: impl Into<String>, wrap_id_15_to_0: bool) -> Self {
        Self {
            source,
            bank_id: bank_id.into(),
            wrap_id_15_to_0,
            state: Arc::new(Mutex::new(PassiveState::default())),
            reader_task: None,
        }
    }

    async fn open_reader(&self) -> Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>, AdapterError> {
        match &self.source {
            PassiveSource::Serial { port, baudrate } => {
                let builder = tokio_serial::new(port, *baudrate);
                let stream = tokio_serial::SerialStream::open(&builder)
                    .map_err(|e| AdapterError::TransportOpen(e.to_string()))?;
                Ok(Box::new(stream))
            }
            PassiveSource::Tcp { addr } => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| AdapterError::TransportOpen(e.to_string()))?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Position and kind of the earliest recognizable frame start in `buf` at
/// or after `start`. Mirrors `find_next_frame_start` — the data-frame magic
/// wins ties against a Modbus preamble starting at the same position.
enum FrameStart {
    Data(usize),
    Modbus(usize),
}

fn find_next_frame_start(buf: &[u8], start: usize) -> Option<FrameStart> {
    let data_pos = buf[start..]
        .windows(DATA_FRAME_START.len())
        .position(|w| w == DATA_FRAME_START)
        .map(|p| p + start);

    let modbus_pos = (start..buf.len().saturating_sub(2))
        .find(|&i| buf[i + 1..i + 3] == MODBUS_PATTERN);

    match (data_pos, modbus_pos) {
        (Some(d), Some(m)) if d <= m => Some(FrameStart::Data(d)),
        (Some(d), None) => Some(FrameStart::Data(d)),
        (_, Some(m)) => Some(FrameStart::Modbus(m)),
        (None, None) => None,
    }
}

/// Parses a Modbus request/response starting at `data[0]`, scanning for the
/// first valid trailing CRC (spec §4.1 item 4: "a Modbus RTU frame matching
/// `{unit_id} 10 16 ...` with CRC-16 ... validating tail").
fn parse_modbus_frame(data: &[u8]) -> Option<(u8, u8, usize)> {
    if data.len() < 6 {
        return None;
    }
    let battery_id = data[0];
    if data[1..3] != MODBUS_PATTERN {
        return None;
    }
    let frame_type = data[3];
    let max_check = data.len().min(MAX_MODBUS_FRAME_LEN);
    for end_pos in 6..=max_check {
        let body = &data[..end_pos - 2];
        let received = data[end_pos - 2] as u16 | ((data[end_pos - 1] as u16) << 8);
        if modbus_crc16(body) == received {
            return Some((battery_id, frame_type, end_pos));
        }
    }
    None
}

fn read_le_u16(buf: &[u8], offset: usize) -> Option<u16> {
    if offset + 2 > buf.len() {
        return None;
    }
    Some(u16::from_le_bytes([buf[offset], buf[offset + 1]]))
}

fn read_le_i32(buf: &[u8], offset: usize) -> Option<i32> {
    if offset + 4 > buf.len() {
        return None;
    }
    Some(i32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]))
}

fn read_le_u32(buf: &[u8], offset: usize) -> Option<u32> {
    if offset + 4 > buf.len() {
        return None;
    }
    Some(u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]))
}

/// Decodes a status frame (≥236 bytes) per the shared table in spec §4.1
/// "Frame decoding tables".
fn decode_status_frame(payload: &[u8]) -> PassiveBatteryRecord {
    let mut cells = Vec::with_capacity(CELL_COUNT);
    for cell in 0..CELL_COUNT {
        let voltage_v = read_le_u16(payload, 6 + cell * 2).unwrap_or(0) as f64 / 1000.0;
        let resistance_mohm = if payload.len() >= 236 {
            (read_le_u16(payload, 80 + cell * 2).unwrap_or(0) as i16) as f64 / 1000.0
        } else {
            0.0
        };
        cells.push(BatteryCellRecord { voltage_v, resistance_mohm, balancing: false });
    }

    let pack_current_a = read_le_i32(payload, 158).unwrap_or(0) as f64 / 1000.0;
    let pack_voltage_v = read_le_u16(payload, 234).unwrap_or(0) as f64 / 100.0;
    let soc_pct = payload.get(173).copied().unwrap_or(0);
    let soh_pct = payload.get(190).copied().unwrap_or(0);
    let cycles = read_le_u32(payload, 182).unwrap_or(0);
    let charge_switch = payload.get(198).map(|&b| b != 0).unwrap_or(false);
    let discharge_switch = payload.get(199).map(|&b| b != 0).unwrap_or(false);
    let balance_switch = payload.get(200).map(|&b| b != 0).unwrap_or(false);
    let status_flags = (charge_switch as u32) | ((discharge_switch as u32) << 1) | ((balance_switch as u32) << 2);

    PassiveBatteryRecord { cells, pack_voltage_v, pack_current_a, soc_pct, soh_pct, cycles, status_flags }
}

/// 4-byte signed, scaled configuration fields (spec §4.1 "Frame decoding
/// tables"), grounded on `jkbms_monitor.py`'s `CONFIG_FIELDS` table.
const CONFIG_FIELDS: &[(&str, usize, f64)] = &[
    ("smart_sleep_voltage", 6, 1000.0),
    ("cell_undervoltage_protection", 10, 1000.0),
    ("cell_undervoltage_recovery", 14, 1000.0),
    ("cell_overvoltage_protection", 18, 1000.0),
    ("cell_overvoltage_recovery", 22, 1000.0),
    ("balance_trigger_voltage", 26, 1000.0),
    ("cell_soc100_voltage", 30, 1000.0),
    ("cell_soc0_voltage", 34, 1000.0),
    ("cell_request_charge_voltage", 38, 1000.0),
    ("cell_request_float_voltage", 42, 1000.0),
    ("power_off_voltage", 46, 1000.0),
    ("max_charge_current", 50, 1000.0),
    ("charge_overcurrent_delay", 54, 1.0),
    ("charge_overcurrent_recovery", 58, 1.0),
    ("max_discharge_current", 62, 1000.0),
    ("discharge_overcurrent_delay", 66, 1.0),
    ("discharge_overcurrent_recovery", 70, 1.0),
    ("short_circuit_recovery", 74, 1.0),
    ("max_balance_current", 78, 1000.0),
    ("charge_overtemp_protection", 82, 10.0),
    ("charge_overtemp_recovery", 86, 10.0),
    ("discharge_overtemp_protection", 90, 10.0),
    ("discharge_overtemp_recovery", 94, 10.0),
    ("charge_undertemp_protection", 98, 10.0),
    ("charge_undertemp_recovery", 102, 10.0),
    ("power_tube_overtemp_protection", 106, 10.0),
    ("power_tube_overtemp_recovery", 110, 10.0),
    ("cell_count", 114, 1.0),
    ("total_battery_capacity", 130, 1000.0),
    ("short_circuit_delay", 134, 1.0),
    ("balance_starting_voltage", 138, 1000.0),
    ("wire_resistance_1", 158, 1000.0),
    ("device_address", 270, 1.0),
];

/// Single-byte configuration switches, stored as 0.0/1.0 in the same map.
const CONFIG_SWITCH_FIELDS: &[(&str, usize)] = &[("charging_switch", 118), ("discharging_switch", 122), ("balance_switch", 126)];

/// Decodes the ~40 declarative configuration fields plus the byte
/// 282/283 bit flags (spec §4.1 "Frame decoding tables"). Returned as a
/// free-form map since configuration has no place in `BatteryBankTelemetry`
/// — surfaced through `handle_command`'s `ReadConfig` introspection rather
/// than polling.
fn decode_config_frame(payload: &[u8]) -> HashMap<String, f64> {
    let mut out = HashMap::with_capacity(CONFIG_FIELDS.len() + CONFIG_SWITCH_FIELDS.len() + 4);
    if payload.len() >= 286 {
        for &(name, offset, scale) in CONFIG_FIELDS {
            if let Some(raw) = read_le_i32(payload, offset) {
                out.insert(name.to_string(), raw as f64 / scale);
            }
        }
        for &(name, offset) in CONFIG_SWITCH_FIELDS {
            if let Some(&byte) = payload.get(offset) {
                out.insert(name.to_string(), (byte != 0) as u8 as f64);
            }
        }
    }
    if payload.len() >= 284 {
        out.insert("display_always_on".into(), ((payload[282] >> 4) & 1) as f64);
        out.insert("smart_sleep_switch".into(), ((payload[282] >> 7) & 1) as f64);
        // Upstream reads bit 8 of a single byte, which is always zero; kept
        // for field-name parity rather than corrected.
        out.insert("disable_pcl_module".into(), 0.0);
        out.insert("timed_stored_data".into(), ((payload[283] >> 1) & 1) as f64);
    }
    out
}

async fn run_reader(mut source: Box<dyn tokio::io::AsyncRead + Send + Unpin>, state: Arc<Mutex<PassiveState>>, wrap_15_to_0: bool) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; RECV_CHUNK];
    loop {
        let n = match source.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(_) => return,
        };
        buffer.extend_from_slice(&chunk[..n]);

        let mut pos = 0usize;
        while pos < buffer.len() {
            match find_next_frame_start(&buffer, pos) {
                None => break,
                Some(FrameStart::Modbus(start)) => {
                    match parse_modbus_frame(&buffer[start..]) {
                        Some((mut battery_id, frame_type_byte, length)) => {
                            if wrap_15_to_0 && battery_id == 15 {
                                battery_id = 0;
                            }
                            if frame_type_byte == MODBUS_REQUEST_FN {
                                let mut guard = state.lock().await;
                                guard.current_battery = Some(battery_id);
                            }
                            pos = start + length;
                        }
                        None => pos = start + 1,
                    }
                }
                Some(FrameStart::Data(start)) => {
                    if buffer.len() - start < 5 {
                        break;
                    }
                    let end = match find_next_frame_start(&buffer, start + 1) {
                        Some(FrameStart::Data(next)) => next,
                        Some(FrameStart::Modbus(next)) => next,
                        None => buffer.len(),
                    };
                    let frame = &buffer[start..end];
                    if frame.len() < 5 {
                        break;
                    }
                    let frame_type = frame[4];
                    let payload = &frame[4..];
                    let mut guard = state.lock().await;
                    let battery = guard.current_battery.unwrap_or(0);
                    if frame_type == FRAME_TYPE_STATUS {
                        let record = decode_status_frame(payload);
                        guard.records.insert(battery, record);
                    } else if frame_type == FRAME_TYPE_CONFIG {
                        let config = decode_config_frame(payload);
                        guard.configs.insert(battery, config);
                    }
                    drop(guard);
                    pos = end;
                }
            }
        }
        buffer.drain(..pos);
    }
}

#[async_trait]
impl DeviceAdapter for BmsPassiveAdapter {
    async fn connect(&mut self) -> Result<(), AdapterError> {
        if self.reader_task.is_some() {
            return Ok(());
        }
        let source = self.open_reader().await?;
        let state = self.state.clone();
        let wrap = self.wrap_id_15_to_0;
        self.reader_task = Some(tokio::spawn(run_reader(source, state, wrap)));
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(handle) = self.reader_task.take() {
            handle.abort();
        }
    }

    async fn check_connectivity(&mut self) -> bool {
        self.reader_task.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    async fn read_serial_number(&mut self) -> Result<String, AdapterError> {
        Ok(String::new())
    }

    async fn poll_battery(&mut self, tz: Tz) -> Result<BatteryBankTelemetry, AdapterError> {
        let guard = self.state.lock().await;
        if guard.records.is_empty() {
            return Err(AdapterError::FrameTimeout);
        }
        let mut ids: Vec<&u8> = guard.records.keys().collect();
        ids.sort();
        let units: Vec<BatteryUnitRecord> = ids
            .iter()
            .map(|&&id| {
                let r = &guard.records[&id];
                BatteryUnitRecord {
                    voltage_v: r.pack_voltage_v,
                    current_a: r.pack_current_a,
                    soc_pct: r.soc_pct,
                    soh_pct: r.soh_pct,
                    temperature_c: 0.0,
                    cycles: r.cycles,
                    status_flags: r.status_flags,
                }
            })
            .collect();
        let cells: Vec<Vec<BatteryCellRecord>> = ids.iter().map(|&&id| guard.records[&id].cells.clone()).collect();
        let cells_per_battery = cells.first().map(|c| c.len() as u8).unwrap_or(0);

        let mut bank = crate::aggregation::aggregate_pack(&self.bank_id, Utc::now().with_timezone(&tz), &units, None);
        bank.cells_per_battery = cells_per_battery;
        bank.cells = Some(cells);
        Ok(bank)
    }

    async fn handle_command(&mut self, command: AdapterCommand) -> Result<CommandOutcome, AdapterError> {
        match command {
            AdapterCommand::ReadConfig => {
                let guard = self.state.lock().await;
                let detail = serde_json::to_string(&guard.configs).map_err(|e| AdapterError::UnsupportedCommand(e.to_string()))?;
                Ok(CommandOutcome { ok: true, detail })
            }
            AdapterCommand::Write { .. } | AdapterCommand::WriteMany { .. } => Err(AdapterError::UnsupportedCommand("BMS-Passive accepts no write commands".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_status_frame() -> Vec<u8> {
        let mut frame = vec![0u8; 236];
        frame[0..4].copy_from_slice(&DATA_FRAME_START);
        frame[4] = FRAME_TYPE_STATUS;
        // cell 0 voltage = 3.300V -> 3300 raw, stored at offset 6 relative
        // to payload (frame[4..]), i.e. absolute offset 10.
        frame[10..12].copy_from_slice(&3300u16.to_le_bytes());
        frame[173 + 4] = 77; // soc
        frame[190 + 4] = 98; // soh
        frame
    }

    #[test]
    fn finds_data_frame_before_modbus_pattern() {
        let mut buf = vec![0xAA; 4];
        buf.extend_from_slice(&DATA_FRAME_START);
        match find_next_frame_start(&buf, 0) {
            Some(FrameStart::Data(pos)) => assert_eq!(pos, 4),
            _ => panic!("expected data frame"),
        }
    }

    #[test]
    fn parses_modbus_request_with_valid_crc() {
        let body = [0x05u8, 0x10, 0x16, MODBUS_REQUEST_FN];
        let crc = modbus_crc16(&body);
        let mut frame = body.to_vec();
        frame.push((crc & 0xFF) as u8);
        frame.push((crc >> 8) as u8);
        let (battery_id, frame_type, length) = parse_modbus_frame(&frame).unwrap();
        assert_eq!(battery_id, 5);
        assert_eq!(frame_type, MODBUS_REQUEST_FN);
        assert_eq!(length, frame.len());
    }

    #[test]
    fn battery_15_wraps_to_0_when_enabled() {
        let mut battery_id = 15u8;
        let wrap = true;
        if wrap && battery_id == 15 {
            battery_id = 0;
        }
        assert_eq!(battery_id, 0);
    }

    #[test]
    fn decodes_status_frame_fields() {
        let frame = build_status_frame();
        let record = decode_status_frame(&frame[4..]);
        assert!((record.cells[0].voltage_v - 3.3).abs() < 1e-9);
        assert_eq!(record.soc_pct, 77);
        assert_eq!(record.soh_pct, 98);
    }

    fn build_config_payload() -> Vec<u8> {
        let mut payload = vec![0u8; 286];
        payload[6..10].copy_from_slice(&3300i32.to_le_bytes()); // smart_sleep_voltage
        payload[118] = 1; // charging_switch
        payload[282] = 0b1001_0000; // display_always_on + smart_sleep_switch
        payload[283] = 0b0000_0010; // timed_stored_data
        payload
    }

    #[test]
    fn decodes_full_config_field_table() {
        let config = decode_config_frame(&build_config_payload());
        assert!((config["smart_sleep_voltage"] - 3.3).abs() < 1e-9);
        assert_eq!(config["charging_switch"], 1.0);
        assert_eq!(config["display_always_on"], 1.0);
        assert_eq!(config["smart_sleep_switch"], 1.0);
        assert_eq!(config["timed_stored_data"], 1.0);
        assert_eq!(config.len(), CONFIG_FIELDS.len() + CONFIG_SWITCH_FIELDS.len() + 4);
    }

    #[tokio::test]
    async fn handle_command_read_config_surfaces_decoded_map() {
        let adapter = BmsPassiveAdapter::new(PassiveSource::Tcp { addr: "127.0.0.1:1".parse().unwrap() }, "bank1", false);
        {
            let mut guard = adapter.state.lock().await;
            guard.configs.insert(0, decode_config_frame(&build_config_payload()));
        }
        let mut adapter = adapter;
        let outcome = adapter.handle_command(AdapterCommand::ReadConfig).await.unwrap();
        assert!(outcome.ok);
        assert!(outcome.detail.contains("smart_sleep_voltage"));
    }

    #[tokio::test]
    async fn handle_command_rejects_writes() {
        let mut adapter = BmsPassiveAdapter::new(PassiveSource::Tcp { addr: "127.0.0.1:1".parse().unwrap() }, "bank1", false);
        let result = adapter.handle_command(AdapterCommand::Write { id: "x".into(), value: 1 }).await;
        assert!(matches!(result, Err(AdapterError::UnsupportedCommand(_))));
    }
}
