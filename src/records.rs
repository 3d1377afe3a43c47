//! Device record decoding for ServerPostData (0x0500) payloads.
//!
//! A 0x0500 payload is a sequence of length-delimited device records, each
//! introduced by an 8-byte header carrying a 16-bit device-type code, a
//! 32-bit device id, and the body length. Records are decoded into typed
//! structs and collected into a [`Snapshot`] keyed the way the cloud
//! service keys them: device-type namespace, then device id, with an extra
//! discriminator for meters (record type) and batteries (battery id) so
//! concurrent records with one timestamp don't overwrite each other.

use std::collections::BTreeMap;

use bytes::Buf;
use chrono::{Local, LocalResult, TimeZone};
use deku::prelude::*;
use log::debug;
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Serialize, Serializer};
use thiserror::Error;

pub const DEVICE_HEADER_LEN: usize = 8;

pub const DEV_OPTIMIZER: u16 = 0x0000;
pub const DEV_INVERTER_1PH: u16 = 0x0010;
pub const DEV_INVERTER_3PH: u16 = 0x0011;
pub const DEV_METER: u16 = 0x0022;
pub const DEV_BATTERY: u16 = 0x0030;
pub const DEV_OPTIMIZER_PACKED: u16 = 0x0080;
pub const DEV_EVENT: u16 = 0x0300;

const OPTIMIZER_LEN: usize = 36;
const PACKED_OPTIMIZER_LEN: usize = 13;
const INVERTER_1PH_LEN: usize = 104;
const INVERTER_3PH_LEN: usize = 128;
const EVENT_LEN: usize = 28;
const BATTERY_LEN: usize = 86;
const METER_LEN: usize = 58;

/// Little-endian bit pattern `ff ff 7f ff`: a float field the device did
/// not report. Decoded as NaN, never as the huge negative value the bits
/// would otherwise represent.
const NOT_REPORTED: u32 = 0xff7f_ffff;

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct DeviceHeader {
    pub se_type: u16,
    pub se_id: u32,
    pub dev_len: u16,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RecordError {
    #[error("device data truncated: {0} bytes left, header needs {DEVICE_HEADER_LEN}")]
    TruncatedHeader(usize),
    #[error("device 0x{se_type:04x} body of {dev_len} bytes overruns remaining {remaining}")]
    BodyOverrun {
        se_type: u16,
        dev_len: u16,
        remaining: usize,
    },
    #[error("device 0x{se_type:04x} record too short ({got} bytes, need {need})")]
    BodyTooShort { se_type: u16, need: usize, got: usize },
    #[error("failed to parse device header: {0}")]
    HeaderError(#[from] DekuError),
}

/// Device ids have a vendor quirk: bit 0x00800000 is sometimes set on the
/// wire but never part of the id. Rendered as uppercase hex.
pub fn format_device_id(se_id: u32) -> String {
    format!("{:X}", se_id & 0xff7f_ffff)
}

/// Local date of an epoch timestamp, `YYYY-MM-DD`.
pub fn format_date(timestamp: u32) -> String {
    match Local.timestamp_opt(timestamp as i64, 0) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.format("%Y-%m-%d").to_string(),
        LocalResult::None => format!("{timestamp} is not a valid date"),
    }
}

/// Local time of day of an epoch timestamp, `HH:MM:SS`.
pub fn format_time(timestamp: u32) -> String {
    match Local.timestamp_opt(timestamp as i64, 0) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.format("%H:%M:%S").to_string(),
        LocalResult::None => format!("{timestamp} is not a valid time"),
    }
}

/// asctime-style local rendering of an epoch timestamp, falling back to a
/// hex dump of the raw little-endian value if it is out of range.
pub fn format_date_time(timestamp: u32) -> String {
    match Local.timestamp_opt(timestamp as i64, 0) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
            dt.format("%a %b %e %H:%M:%S %Y").to_string()
        }
        LocalResult::None => hex::encode(timestamp.to_le_bytes()),
    }
}

/// Hex rendering used for undeciphered bytes: space-separated pairs in
/// 16-byte groups.
pub fn hex_data(data: &[u8]) -> String {
    data.chunks(16)
        .map(|chunk| {
            chunk
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

fn nan(v: &f32) -> bool {
    v.is_nan()
}

/// Sequential little-endian field reader over a record body. Callers check
/// the body length up front, so reads never run off the end.
struct FieldReader<'a>(&'a [u8]);

impl<'a> FieldReader<'a> {
    fn new(body: &'a [u8]) -> Self {
        FieldReader(body)
    }

    fn u16(&mut self) -> u16 {
        self.0.get_u16_le()
    }

    fn u32(&mut self) -> u32 {
        self.0.get_u32_le()
    }

    fn i32(&mut self) -> i32 {
        self.0.get_i32_le()
    }

    fn i8(&mut self) -> i8 {
        self.0.get_i8()
    }

    fn f32(&mut self) -> f32 {
        let raw = self.0.get_u32_le();
        if raw == NOT_REPORTED {
            f32::NAN
        } else {
            f32::from_bits(raw)
        }
    }

    fn bytes(&mut self, n: usize) -> &'a [u8] {
        let (taken, rest) = self.0.split_at(n);
        self.0 = rest;
        taken
    }

    fn skip(&mut self, n: usize) {
        self.0.advance(n);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizerRecord {
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Inverter")]
    pub inverter: String,
    #[serde(rename = "Uptime")]
    pub uptime: u32,
    #[serde(rename = "Vmod", skip_serializing_if = "nan")]
    pub v_mod: f32,
    #[serde(rename = "Vopt", skip_serializing_if = "nan")]
    pub v_opt: f32,
    #[serde(rename = "Imod", skip_serializing_if = "nan")]
    pub i_mod: f32,
    #[serde(rename = "Eday", skip_serializing_if = "nan")]
    pub e_day: f32,
    #[serde(rename = "Temp", skip_serializing_if = "nan")]
    pub temp: f32,
    #[serde(skip)]
    pub timestamp: u32,
}

/// Legacy (type 0x0000) optimizer telemetry: plain little-endian fields.
fn parse_optimizer(id: &str, body: &[u8]) -> Result<OptimizerRecord, RecordError> {
    if body.len() < OPTIMIZER_LEN {
        return Err(RecordError::BodyTooShort {
            se_type: DEV_OPTIMIZER,
            need: OPTIMIZER_LEN,
            got: body.len(),
        });
    }
    let mut r = FieldReader::new(body);
    let timestamp = r.u32();
    let inverter = format_device_id(r.u32());
    r.skip(4);
    let uptime = r.u32();
    Ok(OptimizerRecord {
        date: format_date(timestamp),
        time: format_time(timestamp),
        id: id.to_string(),
        inverter,
        uptime,
        v_mod: r.f32(),
        v_opt: r.f32(),
        i_mod: r.f32(),
        e_day: r.f32(),
        temp: r.f32(),
        timestamp,
    })
}

/// Packed (type 0x0080) optimizer telemetry. 13 bytes, bit-packed:
/// two 10-bit voltages in 1/8 V, a 12-bit current in 1/160 A, a 16-bit
/// daily energy in 1/4 Wh, and a signed temperature in 2 degC steps. The
/// record carries no inverter id.
fn parse_packed_optimizer(id: &str, body: &[u8]) -> Result<OptimizerRecord, RecordError> {
    if body.len() < PACKED_OPTIMIZER_LEN {
        return Err(RecordError::BodyTooShort {
            se_type: DEV_OPTIMIZER_PACKED,
            need: PACKED_OPTIMIZER_LEN,
            got: body.len(),
        });
    }
    let timestamp = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let uptime = u16::from_le_bytes([body[4], body[5]]) as u32;
    let v_mod = 0.125 * (body[6] as u16 | ((body[7] as u16 & 0x03) << 8)) as f32;
    let v_opt = 0.125 * ((body[7] >> 2) as u16 | ((body[8] as u16 & 0x0f) << 6)) as f32;
    let i_mod = 0.00625 * (((body[9] as u16) << 4) | ((body[8] >> 4) & 0x0f) as u16) as f32;
    let e_day = 0.25 * (((body[11] as u16) << 8) | body[10] as u16) as f32;
    let temp = 2.0 * (body[12] as i8) as f32;
    Ok(OptimizerRecord {
        date: format_date(timestamp),
        time: format_time(timestamp),
        id: id.to_string(),
        inverter: "0".to_string(),
        uptime,
        v_mod,
        v_opt,
        i_mod,
        e_day,
        temp,
        timestamp,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InverterRecord {
    SinglePhase(SinglePhaseInverter),
    ThreePhase(ThreePhaseInverter),
}

impl InverterRecord {
    pub fn timestamp(&self) -> u32 {
        match self {
            InverterRecord::SinglePhase(rec) => rec.timestamp,
            InverterRecord::ThreePhase(rec) => rec.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinglePhaseInverter {
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Uptime")]
    pub uptime: u32,
    #[serde(rename = "Interval")]
    pub interval: u32,
    #[serde(rename = "Temp", skip_serializing_if = "nan")]
    pub temp: f32,
    #[serde(rename = "Eday", skip_serializing_if = "nan")]
    pub e_day: f32,
    #[serde(rename = "Eac", skip_serializing_if = "nan")]
    pub e_ac: f32,
    #[serde(rename = "Vac", skip_serializing_if = "nan")]
    pub v_ac: f32,
    #[serde(rename = "Iac", skip_serializing_if = "nan")]
    pub i_ac: f32,
    #[serde(rename = "Freq", skip_serializing_if = "nan")]
    pub freq: f32,
    #[serde(rename = "Vdc", skip_serializing_if = "nan")]
    pub v_dc: f32,
    #[serde(rename = "Etot", skip_serializing_if = "nan")]
    pub e_total: f32,
    #[serde(rename = "Pmax", skip_serializing_if = "nan")]
    pub p_max: f32,
    #[serde(rename = "Pac", skip_serializing_if = "nan")]
    pub p_ac: f32,
    #[serde(skip)]
    pub timestamp: u32,
}

/// Single-phase (type 0x0010) inverter telemetry. The 104-byte body has 26
/// little-endian words; only the deciphered ones are kept.
fn parse_inverter(id: &str, body: &[u8]) -> Result<SinglePhaseInverter, RecordError> {
    if body.len() < INVERTER_1PH_LEN {
        return Err(RecordError::BodyTooShort {
            se_type: DEV_INVERTER_1PH,
            need: INVERTER_1PH_LEN,
            got: body.len(),
        });
    }
    let mut r = FieldReader::new(body);
    let timestamp = r.u32();
    let uptime = r.u32();
    let interval = r.u32();
    let temp = r.f32();
    let e_day = r.f32();
    let e_ac = r.f32();
    let v_ac = r.f32();
    let i_ac = r.f32();
    let freq = r.f32();
    r.skip(8); // two undeciphered words, usually the not-reported sentinel
    let v_dc = r.f32();
    r.skip(4);
    let e_total = r.f32();
    r.skip(16);
    let p_max = r.f32();
    r.skip(16);
    let p_ac = r.f32();
    Ok(SinglePhaseInverter {
        date: format_date(timestamp),
        time: format_time(timestamp),
        id: id.to_string(),
        uptime,
        interval,
        temp,
        e_day,
        e_ac,
        v_ac,
        i_ac,
        freq,
        v_dc,
        e_total,
        p_max,
        p_ac,
        timestamp,
    })
}

/// Operating mode reported by three-phase inverters. The codes are not
/// contiguous on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u32)]
pub enum InverterMode {
    Off = 1,
    Sleeping = 2,
    Starting = 3,
    Mppt = 4,
    ShuttingDown = 6,
    Standby = 8,
    #[num_enum(catch_all)]
    Unknown(u32),
}

impl Serialize for InverterMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(u32::from(*self))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreePhaseInverter {
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Uptime")]
    pub uptime: u32,
    #[serde(rename = "Interval")]
    pub interval: u32,
    #[serde(rename = "Temp", skip_serializing_if = "nan")]
    pub temp: f32,
    #[serde(rename = "Eday", skip_serializing_if = "nan")]
    pub e_day: f32,
    #[serde(rename = "Eac", skip_serializing_if = "nan")]
    pub e_ac: f32,
    #[serde(rename = "Vac1", skip_serializing_if = "nan")]
    pub v_ac1: f32,
    #[serde(rename = "Vac2", skip_serializing_if = "nan")]
    pub v_ac2: f32,
    #[serde(rename = "Vac3", skip_serializing_if = "nan")]
    pub v_ac3: f32,
    #[serde(rename = "Iac1", skip_serializing_if = "nan")]
    pub i_ac1: f32,
    #[serde(rename = "Iac2", skip_serializing_if = "nan")]
    pub i_ac2: f32,
    #[serde(rename = "Iac3", skip_serializing_if = "nan")]
    pub i_ac3: f32,
    #[serde(rename = "Freq1", skip_serializing_if = "nan")]
    pub freq1: f32,
    #[serde(rename = "Freq2", skip_serializing_if = "nan")]
    pub freq2: f32,
    #[serde(rename = "Freq3", skip_serializing_if = "nan")]
    pub freq3: f32,
    #[serde(rename = "EdayDC")]
    pub e_day_dc: u32,
    #[serde(rename = "Edc")]
    pub e_dc: u32,
    #[serde(rename = "Vdc", skip_serializing_if = "nan")]
    pub v_dc: f32,
    #[serde(rename = "Idc")]
    pub i_dc: u32,
    #[serde(rename = "Etot", skip_serializing_if = "nan")]
    pub e_total: f32,
    #[serde(rename = "Irdc", skip_serializing_if = "nan")]
    pub i_rcd: f32,
    #[serde(rename = "data21")]
    pub data21: u32,
    #[serde(rename = "data22")]
    pub data22: u32,
    #[serde(rename = "data23")]
    pub data23: u32,
    #[serde(rename = "CosPhi1", skip_serializing_if = "nan")]
    pub cos_phi1: f32,
    #[serde(rename = "CosPhi2", skip_serializing_if = "nan")]
    pub cos_phi2: f32,
    #[serde(rename = "CosPhi3", skip_serializing_if = "nan")]
    pub cos_phi3: f32,
    #[serde(rename = "mode")]
    pub mode: InverterMode,
    #[serde(rename = "GndFrR", skip_serializing_if = "nan")]
    pub ground_fault_resistance: f32,
    #[serde(rename = "data29", skip_serializing_if = "nan")]
    pub data29: f32,
    #[serde(rename = "IoutDC", skip_serializing_if = "nan")]
    pub i_out_dc: f32,
    #[serde(rename = "data31")]
    pub data31: u32,
    #[serde(skip)]
    pub timestamp: u32,
}

/// Three-phase (type 0x0011) inverter telemetry: 32 little-endian words,
/// all retained.
fn parse_inverter_3ph(id: &str, body: &[u8]) -> Result<ThreePhaseInverter, RecordError> {
    if body.len() < INVERTER_3PH_LEN {
        return Err(RecordError::BodyTooShort {
            se_type: DEV_INVERTER_3PH,
            need: INVERTER_3PH_LEN,
            got: body.len(),
        });
    }
    let mut r = FieldReader::new(body);
    let timestamp = r.u32();
    Ok(ThreePhaseInverter {
        date: format_date(timestamp),
        time: format_time(timestamp),
        id: id.to_string(),
        uptime: r.u32(),
        interval: r.u32(),
        temp: r.f32(),
        e_day: r.f32(),
        e_ac: r.f32(),
        v_ac1: r.f32(),
        v_ac2: r.f32(),
        v_ac3: r.f32(),
        i_ac1: r.f32(),
        i_ac2: r.f32(),
        i_ac3: r.f32(),
        freq1: r.f32(),
        freq2: r.f32(),
        freq3: r.f32(),
        e_day_dc: r.u32(),
        e_dc: r.u32(),
        v_dc: r.f32(),
        i_dc: r.u32(),
        e_total: r.f32(),
        i_rcd: r.f32(),
        data21: r.u32(),
        data22: r.u32(),
        data23: r.u32(),
        cos_phi1: r.f32(),
        cos_phi2: r.f32(),
        cos_phi3: r.f32(),
        mode: InverterMode::from(r.u32()),
        ground_fault_resistance: r.f32(),
        data29: r.f32(),
        i_out_dc: r.f32(),
        data31: r.u32(),
        timestamp,
    })
}

/// The third word of an event record is an end timestamp for type-0 events
/// but a timezone offset for type-1 events (and vice versa for the fourth
/// word). Both interpretations are preserved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventField {
    Time(String),
    Value(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Type")]
    pub event_type: u32,
    #[serde(rename = "Event1")]
    pub event1: String,
    #[serde(rename = "Event2")]
    pub event2: EventField,
    #[serde(rename = "Event3")]
    pub event3: EventField,
    #[serde(skip)]
    pub timestamp: u32,
}

/// Wake/sleep event record (type 0x0300).
fn parse_event(id: &str, body: &[u8]) -> Result<EventRecord, RecordError> {
    if body.len() < EVENT_LEN {
        return Err(RecordError::BodyTooShort {
            se_type: DEV_EVENT,
            need: EVENT_LEN,
            got: body.len(),
        });
    }
    let mut r = FieldReader::new(body);
    let timestamp = r.u32();
    let event_type = r.u32();
    let start = r.u32();
    let field3 = r.i32();
    let field4 = r.u32();
    let (event2, event3) = if event_type == 0 {
        // field3 is the event end time, field4 a zero placeholder
        (
            EventField::Time(format_date_time(field3 as u32)),
            EventField::Value(field4 as i64),
        )
    } else {
        // field3 is a timezone offset, field4 the event end time
        (
            EventField::Value(field3 as i64),
            EventField::Time(format_date_time(field4)),
        )
    };
    Ok(EventRecord {
        date: format_date(timestamp),
        time: format_time(timestamp),
        id: id.to_string(),
        event_type,
        event1: format_date_time(start),
        event2,
        event3,
        timestamp,
    })
}

/// Charging state reported by batteries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u16)]
pub enum ChargingStatus {
    Charging = 3,
    Discharging = 4,
    Holding = 6,
    #[num_enum(catch_all)]
    Unknown(u16),
}

impl Serialize for ChargingStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(u16::from(*self))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryRecord {
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "batteryId")]
    pub battery_id: String,
    #[serde(rename = "Vdc", skip_serializing_if = "nan")]
    pub v_dc: f32,
    #[serde(rename = "Idc", skip_serializing_if = "nan")]
    pub i_dc: f32,
    #[serde(rename = "BattCapacityNom", skip_serializing_if = "nan")]
    pub capacity_nominal: f32,
    #[serde(rename = "BattCapacityActual", skip_serializing_if = "nan")]
    pub capacity_actual: f32,
    #[serde(rename = "BattCharge", skip_serializing_if = "nan")]
    pub charge: f32,
    #[serde(rename = "TotalEnergyIn")]
    pub total_energy_in: u32,
    #[serde(rename = "TotalEnergyOut")]
    pub total_energy_out: u32,
    #[serde(rename = "Temp", skip_serializing_if = "nan")]
    pub temp: f32,
    #[serde(rename = "BattChargingStatus")]
    pub charging_status: ChargingStatus,
    #[serde(rename = "Interval")]
    pub interval: u32,
    #[serde(rename = "EIn")]
    pub interval_energy_in: u32,
    #[serde(rename = "EOut")]
    pub interval_energy_out: u32,
    #[serde(rename = "Undeciphered_data", skip_serializing_if = "Option::is_none")]
    pub undeciphered: Option<String>,
    #[serde(skip)]
    pub timestamp: u32,
}

/// Battery telemetry (type 0x0030): 86-byte body with a 12-byte battery
/// identifier after the timestamp. Several words are constant or always
/// zero and are not retained.
fn parse_battery(id: &str, body: &[u8]) -> Result<BatteryRecord, RecordError> {
    if body.len() < BATTERY_LEN {
        return Err(RecordError::BodyTooShort {
            se_type: DEV_BATTERY,
            need: BATTERY_LEN,
            got: body.len(),
        });
    }
    let mut r = FieldReader::new(body);
    let timestamp = r.u32();
    let battery_id = String::from_utf8_lossy(r.bytes(12))
        .trim_end_matches('\0')
        .to_string();
    let v_dc = r.f32();
    let i_dc = r.f32();
    let capacity_nominal = r.f32();
    let capacity_actual = r.f32();
    let charge = r.f32();
    let total_energy_in = r.u32();
    r.skip(4); // always-zero float
    let total_energy_out = r.u32();
    r.skip(4); // always-zero float
    r.skip(8); // two constant words of unknown meaning
    let temp = r.f32();
    let charging_status = ChargingStatus::from(r.u16());
    r.skip(8); // two always-zero floats
    let interval = r.u32();
    let interval_energy_in = r.u32();
    let interval_energy_out = r.u32();
    let undeciphered = (body.len() > BATTERY_LEN).then(|| hex_data(&body[BATTERY_LEN..]));
    Ok(BatteryRecord {
        date: format_date(timestamp),
        time: format_time(timestamp),
        id: id.to_string(),
        battery_id,
        v_dc,
        i_dc,
        capacity_nominal,
        capacity_actual,
        charge,
        total_energy_in,
        total_energy_out,
        temp,
        charging_status,
        interval,
        interval_energy_in,
        interval_energy_out,
        undeciphered,
        timestamp,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterRecord {
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "recType")]
    pub rec_type: i8,
    #[serde(rename = "onlyIntervalData")]
    pub only_interval_data: i8,
    #[serde(rename = "TotalE2Grid")]
    pub total_to_grid: u32,
    #[serde(rename = "Flag_off12_hex")]
    pub total_to_grid_flag: String,
    #[serde(rename = "TotalEfromGrid")]
    pub total_from_grid: u32,
    #[serde(rename = "Flag_off20_hex")]
    pub total_from_grid_flag: String,
    #[serde(rename = "Totaloff22_int4")]
    pub total_off22: u32,
    #[serde(rename = "Flag_off28_hex")]
    pub total_off22_flag: String,
    #[serde(rename = "Totaloff30_int4")]
    pub total_off30: u32,
    #[serde(rename = "Flag_off36_hex")]
    pub total_off30_flag: String,
    #[serde(rename = "Interval")]
    pub interval: u32,
    #[serde(rename = "E2X")]
    pub energy_out: u32,
    #[serde(rename = "EfromX")]
    pub energy_in: u32,
    #[serde(rename = "P2X", skip_serializing_if = "nan")]
    pub power_out: f32,
    #[serde(rename = "PfromX", skip_serializing_if = "nan")]
    pub power_in: f32,
    #[serde(rename = "Undeciphered_data", skip_serializing_if = "Option::is_none")]
    pub undeciphered: Option<String>,
    #[serde(skip)]
    pub timestamp: u32,
}

impl MeterRecord {
    /// Namespace label distinguishing concurrent meter records that share
    /// a timestamp and device id.
    pub fn rec_type_label(&self) -> String {
        match self.rec_type {
            3 => "3_Consumption".to_string(),
            5 => "5_GridImportExport".to_string(),
            7 => "7_Battery".to_string(),
            8 => "8_MostlyZeroes".to_string(),
            9 => "9_PVProduction".to_string(),
            other => format!("{other}_UnrecognisedRecType"),
        }
    }
}

/// Meter record (type 0x0022): 58-byte body. Each cumulative total is
/// followed by a flag half-word, 0x0000 when the total was reported and
/// 0x0080 when it was not.
fn parse_meter(id: &str, body: &[u8]) -> Result<MeterRecord, RecordError> {
    if body.len() < METER_LEN {
        return Err(RecordError::BodyTooShort {
            se_type: DEV_METER,
            need: METER_LEN,
            got: body.len(),
        });
    }
    let mut r = FieldReader::new(body);
    let timestamp = r.u32();
    let rec_type = r.i8();
    let only_interval_data = r.i8();
    let total_to_grid = r.u32();
    r.skip(2); // padding
    let total_to_grid_flag = hex_data(r.bytes(2));
    let total_from_grid = r.u32();
    r.skip(2);
    let total_from_grid_flag = hex_data(r.bytes(2));
    let total_off22 = r.u32();
    r.skip(2);
    let total_off22_flag = hex_data(r.bytes(2));
    let total_off30 = r.u32();
    r.skip(2);
    let total_off30_flag = hex_data(r.bytes(2));
    let interval = r.u32();
    let energy_out = r.u32();
    let energy_in = r.u32();
    let mut power_out = r.f32();
    let power_in = r.f32();
    // near-minimum float values slip through the sentinel check when the
    // interval is cut short; they are never real power readings
    if power_out < -3.0e38 {
        power_out = f32::NAN;
    }
    let undeciphered = (body.len() > METER_LEN).then(|| hex_data(&body[METER_LEN..]));
    Ok(MeterRecord {
        date: format_date(timestamp),
        time: format_time(timestamp),
        id: id.to_string(),
        rec_type,
        only_interval_data,
        total_to_grid,
        total_to_grid_flag,
        total_from_grid,
        total_from_grid_flag,
        total_off22,
        total_off22_flag,
        total_off30,
        total_off30_flag,
        interval,
        energy_out,
        energy_in,
        power_out,
        power_in,
        undeciphered,
        timestamp,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnknownRecord {
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Undeciphered_data")]
    pub undeciphered: String,
    #[serde(skip)]
    pub timestamp: u32,
}

/// Fallback for device types without a decoder: keep the timestamp and
/// dump the rest as hex for offline analysis.
fn parse_unknown(se_type: u16, id: &str, body: &[u8]) -> Result<UnknownRecord, RecordError> {
    if body.len() < 4 {
        return Err(RecordError::BodyTooShort {
            se_type,
            need: 4,
            got: body.len(),
        });
    }
    let timestamp = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    Ok(UnknownRecord {
        date: format_date(timestamp),
        time: format_time(timestamp),
        id: id.to_string(),
        undeciphered: hex_data(&body[4..]),
        timestamp,
    })
}

/// All devices decoded from one ServerPostData message, keyed by
/// device-type namespace and device id. Key order is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub inverters: BTreeMap<String, InverterRecord>,
    pub optimizers: BTreeMap<String, OptimizerRecord>,
    pub events: BTreeMap<String, EventRecord>,
    #[serde(rename = "batteries_0x0030", skip_serializing_if = "BTreeMap::is_empty")]
    pub batteries: BTreeMap<String, BTreeMap<String, BatteryRecord>>,
    #[serde(rename = "meters_0x0022", skip_serializing_if = "BTreeMap::is_empty")]
    pub meters: BTreeMap<String, BTreeMap<String, MeterRecord>>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, BTreeMap<String, UnknownRecord>>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.inverters.is_empty()
            && self.optimizers.is_empty()
            && self.events.is_empty()
            && self.batteries.is_empty()
            && self.meters.is_empty()
            && self.unknown.is_empty()
    }
}

/// Decode the device records inside a ServerPostData payload into a
/// snapshot.
pub fn parse_device_data(data: &[u8]) -> Result<Snapshot, RecordError> {
    let mut snapshot = Snapshot::default();
    let mut ptr = 0;
    while ptr < data.len() {
        let remaining = data.len() - ptr;
        if remaining < DEVICE_HEADER_LEN {
            return Err(RecordError::TruncatedHeader(remaining));
        }
        let (_, header) = DeviceHeader::from_bytes((&data[ptr..ptr + DEVICE_HEADER_LEN], 0))?;
        ptr += DEVICE_HEADER_LEN;
        let dev_len = header.dev_len as usize;
        if dev_len > data.len() - ptr {
            return Err(RecordError::BodyOverrun {
                se_type: header.se_type,
                dev_len: header.dev_len,
                remaining: data.len() - ptr,
            });
        }
        let body = &data[ptr..ptr + dev_len];
        let id = format_device_id(header.se_id);
        debug!(
            "device {id} type: {:04x} len: {:04x}",
            header.se_type, header.dev_len
        );
        match header.se_type {
            DEV_OPTIMIZER => {
                snapshot.optimizers.insert(id.clone(), parse_optimizer(&id, body)?);
            }
            DEV_OPTIMIZER_PACKED => {
                snapshot
                    .optimizers
                    .insert(id.clone(), parse_packed_optimizer(&id, body)?);
            }
            DEV_INVERTER_1PH => {
                snapshot.inverters.insert(
                    id.clone(),
                    InverterRecord::SinglePhase(parse_inverter(&id, body)?),
                );
            }
            DEV_INVERTER_3PH => {
                snapshot.inverters.insert(
                    id.clone(),
                    InverterRecord::ThreePhase(parse_inverter_3ph(&id, body)?),
                );
            }
            DEV_EVENT => {
                snapshot.events.insert(id.clone(), parse_event(&id, body)?);
            }
            DEV_BATTERY => {
                let record = parse_battery(&id, body)?;
                snapshot
                    .batteries
                    .entry(id)
                    .or_default()
                    .insert(record.battery_id.clone(), record);
            }
            DEV_METER => {
                let record = parse_meter(&id, body)?;
                snapshot
                    .meters
                    .entry(id)
                    .or_default()
                    .insert(record.rec_type_label(), record);
            }
            se_type => {
                let record = parse_unknown(se_type, &id, body)?;
                snapshot
                    .unknown
                    .entry(format!("Unknown_device_{se_type:#06x}"))
                    .or_default()
                    .insert(id, record);
            }
        }
        ptr += dev_len;
    }
    Ok(snapshot)
}
