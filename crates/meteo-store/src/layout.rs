//! Byte layout of the shared segment.
//!
//! Everything here is `#[repr(C)]` and built only from integers, floats and byte
//! arrays, so every bit pattern (including the all-zero one a fresh segment starts
//! with) is a valid value. That is what makes it sound to view foreign memory as
//! these types.

use meteo_proto::frame::{Environmental, Gps, LightRain, SystemStatus};
use meteo_proto::{Frame, FrameKind, Payload};

pub const SHARED_MEMORY_MAGIC: u32 = 0xDEAD_BEEF;
pub const MAX_HISTORY_COUNT: usize = 100;
pub const SERVER_IP_LEN: usize = 16;
pub const LAST_ERROR_LEN: usize = 256;

pub const KIND_ENVIRONMENTAL: u8 = 1;
pub const KIND_LIGHT_RAIN: u8 = 2;
pub const KIND_SYSTEM_STATUS: u8 = 3;
pub const KIND_GPS: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Disconnected),
            1 => Some(Self::Connecting),
            2 => Some(Self::Connected),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnvironmentalSlot {
    pub node_id: u8,
    pub valid: u8,
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub pressure_hpa: f32,
    /// unix seconds
    pub timestamp: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LightRainSlot {
    pub node_id: u8,
    pub valid: u8,
    pub rainfall_pct: u8,
    pub light_lux: f32,
    pub timestamp: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemStatusSlot {
    pub node_id: u8,
    pub valid: u8,
    pub bme280_status: u8,
    pub bh1750_status: u8,
    pub rain_sensor_status: u8,
    pub i2c_bus_status: u8,
    pub total_errors: u16,
    pub uptime_s: u32,
    pub timestamp: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GpsSlot {
    pub node_id: u8,
    pub valid: u8,
    /// "HHMMSS" plus NUL
    pub utc: [u8; 7],
    pub fix_mode: u8,
    pub satellites: u8,
    pub hdop: f32,
    pub altitude_m: f32,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: i64,
}

impl GpsSlot {
    pub fn utc_str(&self) -> &str {
        nul_terminated(&self.utc)
    }
}

impl EnvironmentalSlot {
    pub(crate) fn from_reading(node_id: u8, e: &Environmental, ts: i64) -> Self {
        Self {
            node_id,
            valid: 1,
            temperature_c: e.temperature_c(),
            humidity_pct: e.humidity_pct(),
            pressure_hpa: e.pressure_hpa(),
            timestamp: ts,
        }
    }
}

impl LightRainSlot {
    pub(crate) fn from_reading(node_id: u8, l: &LightRain, ts: i64) -> Self {
        Self { node_id, valid: 1, rainfall_pct: l.rainfall_pct, light_lux: l.lux(), timestamp: ts }
    }
}

impl SystemStatusSlot {
    pub(crate) fn from_reading(node_id: u8, s: &SystemStatus, ts: i64) -> Self {
        Self {
            node_id,
            valid: 1,
            bme280_status: s.bme280,
            bh1750_status: s.bh1750,
            rain_sensor_status: s.rain_sensor,
            i2c_bus_status: s.i2c_bus,
            total_errors: s.total_errors,
            uptime_s: s.uptime_s,
            timestamp: ts,
        }
    }
}

impl GpsSlot {
    pub(crate) fn from_reading(node_id: u8, g: &Gps, ts: i64) -> Self {
        let mut utc = [0u8; 7];
        utc[..6].copy_from_slice(&g.utc);
        Self {
            node_id,
            valid: 1,
            utc,
            fix_mode: g.fix_mode,
            satellites: g.satellites,
            hdop: g.hdop(),
            altitude_m: g.altitude_m(),
            latitude: g.latitude(),
            longitude: g.longitude(),
            timestamp: ts,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union SlotUnion {
    pub environmental: EnvironmentalSlot,
    pub light_rain: LightRainSlot,
    pub system_status: SystemStatusSlot,
    pub gps: GpsSlot,
}

/// A slot tagged with the variant it holds; `kind == 0` means empty.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TaggedFrame {
    pub kind: u8,
    pub data: SlotUnion,
}

/// Safe, owned view of a [`TaggedFrame`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Record {
    Environmental(EnvironmentalSlot),
    LightRain(LightRainSlot),
    SystemStatus(SystemStatusSlot),
    Gps(GpsSlot),
}

impl Record {
    pub(crate) fn from_frame(frame: &Frame, ts: i64) -> Self {
        let id = frame.node_id;
        match &frame.payload {
            Payload::Environmental(e) => {
                Record::Environmental(EnvironmentalSlot::from_reading(id, e, ts))
            }
            Payload::LightRain(l) => Record::LightRain(LightRainSlot::from_reading(id, l, ts)),
            Payload::SystemStatus(s) => {
                Record::SystemStatus(SystemStatusSlot::from_reading(id, s, ts))
            }
            Payload::Gps(g) => Record::Gps(GpsSlot::from_reading(id, g, ts)),
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Record::Environmental(_) => FrameKind::Environmental,
            Record::LightRain(_) => FrameKind::LightRain,
            Record::SystemStatus(_) => FrameKind::SystemStatus,
            Record::Gps(_) => FrameKind::Gps,
        }
    }

    pub fn node_id(&self) -> u8 {
        match self {
            Record::Environmental(s) => s.node_id,
            Record::LightRain(s) => s.node_id,
            Record::SystemStatus(s) => s.node_id,
            Record::Gps(s) => s.node_id,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Record::Environmental(s) => s.timestamp,
            Record::LightRain(s) => s.timestamp,
            Record::SystemStatus(s) => s.timestamp,
            Record::Gps(s) => s.timestamp,
        }
    }
}

impl TaggedFrame {
    pub fn from_record(record: &Record) -> Self {
        match *record {
            Record::Environmental(s) => {
                Self { kind: KIND_ENVIRONMENTAL, data: SlotUnion { environmental: s } }
            }
            Record::LightRain(s) => {
                Self { kind: KIND_LIGHT_RAIN, data: SlotUnion { light_rain: s } }
            }
            Record::SystemStatus(s) => {
                Self { kind: KIND_SYSTEM_STATUS, data: SlotUnion { system_status: s } }
            }
            Record::Gps(s) => Self { kind: KIND_GPS, data: SlotUnion { gps: s } },
        }
    }

    /// `None` for an empty slot or an unknown tag.
    pub fn record(&self) -> Option<Record> {
        // SAFETY: every union member is plain data valid for any bit pattern; the tag
        // only decides which interpretation is meaningful.
        unsafe {
            match self.kind {
                KIND_ENVIRONMENTAL => Some(Record::Environmental(self.data.environmental)),
                KIND_LIGHT_RAIN => Some(Record::LightRain(self.data.light_rain)),
                KIND_SYSTEM_STATUS => Some(Record::SystemStatus(self.data.system_status)),
                KIND_GPS => Some(Record::Gps(self.data.gps)),
                _ => None,
            }
        }
    }
}

/// The whole shared segment. Written by exactly one receiver process; readers only copy.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SharedTelemetry {
    // control
    pub magic: u32,
    pub writer_pid: u32,
    pub reader_pid: u32,
    pub update_counter: u32,
    pub connection_status: u8,

    pub latest: TaggedFrame,

    pub latest_environmental: EnvironmentalSlot,
    pub latest_light_rain: LightRainSlot,
    pub latest_system_status: SystemStatusSlot,
    pub latest_gps: GpsSlot,

    pub history_write_index: u32,
    pub history_count: u32,
    pub history: [TaggedFrame; MAX_HISTORY_COUNT],

    // statistics
    pub total_received: u32,
    pub total_errors: u32,
    pub last_update_time: i64,
    pub environmental_count: u32,
    pub light_rain_count: u32,
    pub system_status_count: u32,
    pub gps_count: u32,

    // configuration
    pub server_ip: [u8; SERVER_IP_LEN],
    pub server_port: u16,

    pub last_error: [u8; LAST_ERROR_LEN],
}

pub const SHARED_MEMORY_SIZE: usize = std::mem::size_of::<SharedTelemetry>();

/// Copy `s` into a NUL-padded buffer, cut on a char boundary so at least one NUL remains.
pub(crate) fn write_cstr(dst: &mut [u8], s: &str) {
    let max = dst.len().saturating_sub(1);
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    dst.fill(0);
    dst[..end].copy_from_slice(&s.as_bytes()[..end]);
}

pub(crate) fn nul_terminated(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    match std::str::from_utf8(&buf[..end]) {
        Ok(s) => s,
        Err(e) => std::str::from_utf8(&buf[..e.valid_up_to()]).unwrap_or_default(),
    }
}
