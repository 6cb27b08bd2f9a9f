use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crc::{crc4, xor_checksum};
use crate::{END_SYMBOL, FRAME_LEN};

pub const CMD_ENVIRONMENTAL: u8 = 0x01;
pub const CMD_LIGHT_RAIN: u8 = 0x02;
pub const CMD_SYSTEM_STATUS: u8 = 0x03;
pub const CMD_GPS: u8 = 0x04;

/// Sensor variant, selected by the frame's `cmd` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    Environmental,
    LightRain,
    SystemStatus,
    Gps,
}

impl FrameKind {
    pub fn from_cmd(cmd: u8) -> Option<Self> {
        match cmd {
            CMD_ENVIRONMENTAL => Some(Self::Environmental),
            CMD_LIGHT_RAIN => Some(Self::LightRain),
            CMD_SYSTEM_STATUS => Some(Self::SystemStatus),
            CMD_GPS => Some(Self::Gps),
            _ => None,
        }
    }

    pub fn cmd(self) -> u8 {
        match self {
            Self::Environmental => CMD_ENVIRONMENTAL,
            Self::LightRain => CMD_LIGHT_RAIN,
            Self::SystemStatus => CMD_SYSTEM_STATUS,
            Self::Gps => CMD_GPS,
        }
    }

    /// Total on-wire length of the variant, terminator included.
    pub fn frame_len(self) -> usize {
        match self {
            Self::Environmental => 11,
            Self::LightRain => 8,
            Self::SystemStatus => 15,
            Self::Gps => 25,
        }
    }

    /// SystemStatus frames carry a reserved byte where the others carry the CRC4 nibble.
    pub fn has_crc4(self) -> bool {
        !matches!(self, Self::SystemStatus)
    }

    /// Short label used in logs and persisted records.
    pub fn label(self) -> &'static str {
        match self {
            Self::Environmental => "BME280",
            Self::LightRain => "LightRain",
            Self::SystemStatus => "System",
            Self::Gps => "GPS",
        }
    }
}

/// Expected total frame length for a command byte.
pub fn frame_len(cmd: u8) -> Option<usize> {
    FrameKind::from_cmd(cmd).map(FrameKind::frame_len)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("node {node_id} sent unknown cmd 0x{cmd:02X}")]
    UnknownCommand { node_id: u8, cmd: u8 },
    #[error("frame truncated: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("node {node_id} bad tail 0x{tail:02X} for cmd 0x{cmd:02X}")]
    BadTerminator { node_id: u8, cmd: u8, tail: u8 },
    #[error(
        "node {node_id} {} frame checksum error: expected 0x{expected:02X}, got 0x{actual:02X}",
        .kind.label()
    )]
    Checksum { node_id: u8, kind: FrameKind, expected: u8, actual: u8 },
    #[error(
        "node {node_id} {} CRC4 error: expected 0x{expected:X}, got 0x{actual:X}",
        .kind.label()
    )]
    Crc4 { node_id: u8, kind: FrameKind, expected: u8, actual: u8 },
}

/// BME280 reading, fixed-point as sent by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environmental {
    pub temp_c100: i16,
    pub pressure_hpa10: i16,
    pub humidity_pct100: i16,
}

impl Environmental {
    pub fn temperature_c(&self) -> f32 {
        self.temp_c100 as f32 / 100.0
    }

    pub fn pressure_hpa(&self) -> f32 {
        self.pressure_hpa10 as f32 / 10.0
    }

    pub fn humidity_pct(&self) -> f32 {
        self.humidity_pct100 as f32 / 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightRain {
    pub lux10: i16,
    /// 0-100 %
    pub rainfall_pct: u8,
}

impl LightRain {
    pub fn lux(&self) -> f32 {
        self.lux10 as f32 / 10.0
    }
}

/// Node self-report. Status bytes are 0 when the peripheral is healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub bme280: u8,
    pub bh1750: u8,
    pub rain_sensor: u8,
    pub i2c_bus: u8,
    pub uptime_s: u32,
    pub total_errors: u16,
    pub reserved: u8,
}

impl SystemStatus {
    pub fn all_ok(&self) -> bool {
        self.bme280 == 0 && self.bh1750 == 0 && self.rain_sensor == 0 && self.i2c_bus == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gps {
    /// ASCII "HHMMSS"
    pub utc: [u8; 6],
    pub lat_1e5: i32,
    pub lon_1e5: i32,
    pub fix_mode: u8,
    pub satellites: u8,
    pub hdop10: i16,
    pub alt10: i16,
}

impl Gps {
    pub fn latitude(&self) -> f64 {
        self.lat_1e5 as f64 / 1e5
    }

    pub fn longitude(&self) -> f64 {
        self.lon_1e5 as f64 / 1e5
    }

    pub fn hdop(&self) -> f32 {
        self.hdop10 as f32 / 10.0
    }

    pub fn altitude_m(&self) -> f32 {
        self.alt10 as f32 / 10.0
    }

    pub fn utc_str(&self) -> String {
        String::from_utf8_lossy(&self.utc).into_owned()
    }

    /// `(hh, mm, ss)` when the UTC field holds six ASCII digits.
    pub fn utc_hms(&self) -> Option<(u8, u8, u8)> {
        if !self.utc.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let d = |i: usize| (self.utc[i] - b'0') * 10 + (self.utc[i + 1] - b'0');
        Some((d(0), d(2), d(4)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Environmental(Environmental),
    LightRain(LightRain),
    SystemStatus(SystemStatus),
    Gps(Gps),
}

impl Payload {
    pub fn kind(&self) -> FrameKind {
        match self {
            Payload::Environmental(_) => FrameKind::Environmental,
            Payload::LightRain(_) => FrameKind::LightRain,
            Payload::SystemStatus(_) => FrameKind::SystemStatus,
            Payload::Gps(_) => FrameKind::Gps,
        }
    }

    fn put(&self, w: &mut impl BufMut) {
        match self {
            Payload::Environmental(e) => {
                w.put_i16(e.temp_c100);
                w.put_i16(e.pressure_hpa10);
                w.put_i16(e.humidity_pct100);
            }
            Payload::LightRain(l) => {
                w.put_i16(l.lux10);
                w.put_u8(l.rainfall_pct);
            }
            Payload::SystemStatus(s) => {
                w.put_u8(s.bme280);
                w.put_u8(s.bh1750);
                w.put_u8(s.rain_sensor);
                w.put_u8(s.i2c_bus);
                w.put_u32(s.uptime_s);
                w.put_u16(s.total_errors);
                w.put_u8(s.reserved);
            }
            Payload::Gps(g) => {
                w.put_slice(&g.utc);
                w.put_i32(g.lat_1e5);
                w.put_i32(g.lon_1e5);
                w.put_u8(g.fix_mode);
                w.put_u8(g.satellites);
                w.put_i16(g.hdop10);
                w.put_i16(g.alt10);
            }
        }
    }

    fn get(kind: FrameKind, mut r: &[u8]) -> Self {
        match kind {
            FrameKind::Environmental => Payload::Environmental(Environmental {
                temp_c100: r.get_i16(),
                pressure_hpa10: r.get_i16(),
                humidity_pct100: r.get_i16(),
            }),
            FrameKind::LightRain => Payload::LightRain(LightRain {
                lux10: r.get_i16(),
                rainfall_pct: r.get_u8(),
            }),
            FrameKind::SystemStatus => Payload::SystemStatus(SystemStatus {
                bme280: r.get_u8(),
                bh1750: r.get_u8(),
                rain_sensor: r.get_u8(),
                i2c_bus: r.get_u8(),
                uptime_s: r.get_u32(),
                total_errors: r.get_u16(),
                reserved: r.get_u8(),
            }),
            FrameKind::Gps => {
                let mut utc = [0u8; 6];
                r.copy_to_slice(&mut utc);
                Payload::Gps(Gps {
                    utc,
                    lat_1e5: r.get_i32(),
                    lon_1e5: r.get_i32(),
                    fix_mode: r.get_u8(),
                    satellites: r.get_u8(),
                    hdop10: r.get_i16(),
                    alt10: r.get_i16(),
                })
            }
        }
    }
}

/// One validated telemetry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub node_id: u8,
    pub payload: Payload,
}

impl Frame {
    pub fn new(node_id: u8, payload: Payload) -> Self {
        Self { node_id, payload }
    }

    pub fn kind(&self) -> FrameKind {
        self.payload.kind()
    }

    /// Wire bytes in a zero-padded [`FRAME_LEN`] window, CRC4 and checksum filled in.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let kind = self.kind();
        let len = kind.frame_len();
        let mut out = [0u8; FRAME_LEN];
        {
            let mut w = &mut out[..];
            w.put_u8(self.node_id);
            w.put_u8(kind.cmd());
            self.payload.put(&mut w);
        }
        if kind.has_crc4() {
            out[len - 3] = crc4(&out[2..len - 3]);
        }
        out[len - 2] = xor_checksum(&out[..len - 2]);
        out[len - 1] = END_SYMBOL;
        out
    }
}

/// Validate and decode one frame. `buf` may be longer than the variant (padding is ignored).
///
/// The variant is taken from the `cmd` byte, never inferred from anything else.
pub fn decode(buf: &[u8]) -> Result<Frame, FrameError> {
    if buf.len() < 2 {
        return Err(FrameError::Truncated { expected: 2, actual: buf.len() });
    }
    let node_id = buf[0];
    let cmd = buf[1];
    let kind = FrameKind::from_cmd(cmd).ok_or(FrameError::UnknownCommand { node_id, cmd })?;
    let len = kind.frame_len();
    if buf.len() < len {
        return Err(FrameError::Truncated { expected: len, actual: buf.len() });
    }
    let frame = &buf[..len];

    let tail = frame[len - 1];
    if tail != END_SYMBOL {
        return Err(FrameError::BadTerminator { node_id, cmd, tail });
    }

    let expected = xor_checksum(&frame[..len - 2]);
    let actual = frame[len - 2];
    if expected != actual {
        return Err(FrameError::Checksum { node_id, kind, expected, actual });
    }

    if kind.has_crc4() {
        let expected = crc4(&frame[2..len - 3]);
        let actual = frame[len - 3] & 0x0F;
        if expected != actual {
            return Err(FrameError::Crc4 { node_id, kind, expected, actual });
        }
    }

    Ok(Frame { node_id, payload: Payload::get(kind, &frame[2..len - 2]) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(node_id: u8) -> Frame {
        Frame::new(node_id, Payload::Environmental(Environmental {
            temp_c100: 2345,
            pressure_hpa10: 10132,
            humidity_pct100: 5678,
        }))
    }

    fn gps() -> Frame {
        Frame::new(3, Payload::Gps(Gps {
            utc: *b"123456",
            lat_1e5: 3_990_420,
            lon_1e5: -11_640_740,
            fix_mode: 3,
            satellites: 9,
            hdop10: 12,
            alt10: 4567,
        }))
    }

    #[test]
    fn environmental_scenario_decodes() {
        // header {0x05, 0x01}, 9 bytes of payload/crc/checksum, terminator
        let mut raw = vec![0x05, 0x01, 0x09, 0x29, 0x27, 0x94, 0x16, 0x2E];
        let crc = crc4(&raw[2..8]);
        raw.push(crc);
        raw.push(xor_checksum(&raw));
        raw.push(0xFF);
        assert_eq!(raw.len(), 11);

        let f = decode(&raw).unwrap();
        assert_eq!(f.node_id, 5);
        let Payload::Environmental(e) = f.payload else { panic!("wrong variant") };
        assert!((e.temperature_c() - 23.45).abs() < 0.005);
        assert!((e.pressure_hpa() - 1013.2).abs() < 0.05);
        assert!((e.humidity_pct() - 56.78).abs() < 0.005);
    }

    #[test]
    fn encode_produces_padded_window() {
        let raw = env(1).encode();
        assert_eq!(raw[0], 1);
        assert_eq!(raw[1], CMD_ENVIRONMENTAL);
        assert_eq!(raw[10], END_SYMBOL);
        assert!(raw[11..].iter().all(|&b| b == 0));
    }

    #[test]
    fn decode_recovers_every_variant() {
        let frames = [
            env(7),
            Frame::new(2, Payload::LightRain(LightRain { lux10: 9999, rainfall_pct: 100 })),
            Frame::new(4, Payload::SystemStatus(SystemStatus {
                bme280: 0, bh1750: 1, rain_sensor: 0, i2c_bus: 0,
                uptime_s: 86_400, total_errors: 17, reserved: 0,
            })),
            gps(),
        ];
        for f in frames {
            assert_eq!(decode(&f.encode()).unwrap(), f);
        }
    }

    #[test]
    fn gps_values_scale() {
        let Payload::Gps(g) = gps().payload else { unreachable!() };
        assert!((g.latitude() - 39.9042).abs() < 1e-6);
        assert!((g.longitude() + 116.4074).abs() < 1e-6);
        assert!((g.altitude_m() - 456.7).abs() < 0.05);
        assert!((g.hdop() - 1.2).abs() < 0.05);
        assert_eq!(g.utc_str(), "123456");
        assert_eq!(g.utc_hms(), Some((12, 34, 56)));
    }

    #[test]
    fn flipped_checksum_is_rejected() {
        let mut raw = env(5).encode();
        raw[9] ^= 0xFF;
        assert!(matches!(decode(&raw), Err(FrameError::Checksum { node_id: 5, .. })));
    }

    #[test]
    fn corrupted_crc_nibble_is_rejected() {
        let mut raw = env(5).encode();
        // keep the XOR consistent so only the CRC check can catch it
        raw[8] ^= 0x01;
        raw[9] ^= 0x01;
        assert!(matches!(decode(&raw), Err(FrameError::Crc4 { .. })));
    }

    #[test]
    fn any_single_payload_byte_mutation_fails() {
        for f in [env(9), gps()] {
            let good = f.encode();
            let len = f.kind().frame_len();
            for i in 2..len - 3 {
                for delta in [0x01u8, 0x10, 0x80, 0xFF] {
                    let mut bad = good;
                    bad[i] ^= delta;
                    assert!(decode(&bad).is_err(), "byte {i} delta {delta:#x} slipped through");
                }
            }
        }
    }

    #[test]
    fn system_status_has_no_crc_check() {
        let f = Frame::new(1, Payload::SystemStatus(SystemStatus {
            bme280: 0, bh1750: 0, rain_sensor: 0, i2c_bus: 0,
            uptime_s: 3, total_errors: 0, reserved: 0,
        }));
        let mut raw = f.encode();
        // reserved byte changes are only visible to the checksum
        raw[12] = 0x0A;
        raw[13] ^= 0x0A;
        let Payload::SystemStatus(s) = decode(&raw).unwrap().payload else { unreachable!() };
        assert_eq!(s.reserved, 0x0A);
        assert!(s.all_ok());
    }

    #[test]
    fn unknown_command_and_bad_tail() {
        let mut raw = [0u8; FRAME_LEN];
        raw[0] = 1;
        raw[1] = 0x09;
        assert_eq!(decode(&raw), Err(FrameError::UnknownCommand { node_id: 1, cmd: 0x09 }));

        let mut raw = env(1).encode();
        raw[10] = 0x00;
        assert!(matches!(decode(&raw), Err(FrameError::BadTerminator { tail: 0, .. })));
    }

    #[test]
    fn short_buffer_is_truncated() {
        let raw = gps().encode();
        assert_eq!(decode(&raw[..20]), Err(FrameError::Truncated { expected: 25, actual: 20 }));
        assert_eq!(decode(&raw[..1]), Err(FrameError::Truncated { expected: 2, actual: 1 }));
    }

    #[test]
    fn random_windows_never_panic_and_padding_is_ignored() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(0x5EED);
        for _ in 0..2000 {
            let mut raw = [0u8; FRAME_LEN];
            rng.fill(&mut raw[..]);
            raw[1] = rng.gen_range(0..6);
            let _ = decode(&raw);
        }
        for f in [env(3), gps()] {
            let mut raw = f.encode();
            let len = f.kind().frame_len();
            rng.fill(&mut raw[len..]);
            assert_eq!(decode(&raw), Ok(f));
        }
    }

    #[test]
    fn length_lookup() {
        assert_eq!(frame_len(0x01), Some(11));
        assert_eq!(frame_len(0x02), Some(8));
        assert_eq!(frame_len(0x03), Some(15));
        assert_eq!(frame_len(0x04), Some(25));
        assert_eq!(frame_len(0x00), None);
        assert_eq!(frame_len(0xAA), None);
    }
}
