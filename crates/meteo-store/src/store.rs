use std::path::Path;

use meteo_proto::{decode, Frame, FrameError, FrameKind};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::layout::{
    write_cstr, ConnectionStatus, Record, SharedTelemetry, TaggedFrame, MAX_HISTORY_COUNT,
    SHARED_MEMORY_MAGIC, SHARED_MEMORY_SIZE,
};
use crate::shm::SharedRegion;
use crate::StoreError;

/// Sole writer of the shared segment.
///
/// Updates are plain stores with no cross-process locking: a reader copying the
/// segment while a frame is being applied can see fields from two different frames.
/// Readers detect change through `update_counter`, which is bumped last.
pub struct TelemetryStore {
    region: SharedRegion,
    closed: bool,
}

impl TelemetryStore {
    /// Create the segment, or take over an existing one whose magic is intact.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let (region, existed) = SharedRegion::create_or_open(path, SHARED_MEMORY_SIZE)
            .map_err(|source| StoreError::Open { path: path.to_path_buf(), source })?;
        let mut store = Self { region, closed: false };

        let pid = std::process::id();
        let data = store.data_mut();
        if existed && data.magic == SHARED_MEMORY_MAGIC {
            data.writer_pid = pid;
            info!("store: segment {} exists, taking over (pid {})", path.display(), pid);
        } else {
            // SAFETY: the region is exactly SHARED_MEMORY_SIZE bytes and all-zero is valid.
            unsafe { std::ptr::write_bytes(data as *mut SharedTelemetry, 0, 1) };
            data.magic = SHARED_MEMORY_MAGIC;
            data.writer_pid = pid;
            data.connection_status = ConnectionStatus::Disconnected as u8;
            write_cstr(&mut data.last_error, "shared memory initialised");
            info!("store: initialised segment {} ({} bytes)", path.display(), SHARED_MEMORY_SIZE);
        }
        Ok(store)
    }

    fn data(&self) -> &SharedTelemetry {
        // SAFETY: the mapping is SHARED_MEMORY_SIZE bytes, page aligned, and any bit
        // pattern is a valid SharedTelemetry.
        unsafe { &*(self.region.as_ptr() as *const SharedTelemetry) }
    }

    fn data_mut(&mut self) -> &mut SharedTelemetry {
        // SAFETY: as in `data`; this process is the only writer.
        unsafe { &mut *(self.region.as_mut_ptr() as *mut SharedTelemetry) }
    }

    pub fn path(&self) -> &Path {
        self.region.path()
    }

    pub fn update_counter(&self) -> u32 {
        self.data().update_counter
    }

    pub fn total_errors(&self) -> u32 {
        self.data().total_errors
    }

    pub fn total_received(&self) -> u32 {
        self.data().total_received
    }

    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        ConnectionStatus::from_u8(self.data().connection_status)
    }

    /// Record the relay address readers should display.
    pub fn set_peer(&mut self, host: &str, port: u16) {
        let data = self.data_mut();
        write_cstr(&mut data.server_ip, host);
        data.server_port = port;
    }

    pub fn set_connection_status(&mut self, status: ConnectionStatus) {
        let data = self.data_mut();
        data.connection_status = status as u8;
        data.last_update_time = now_unix();
    }

    pub fn set_last_error(&mut self, msg: &str) {
        let data = self.data_mut();
        write_cstr(&mut data.last_error, msg);
        data.last_update_time = now_unix();
    }

    /// Validate one frame window and apply it.
    ///
    /// A frame that fails validation only increments `total_errors`.
    pub fn record(&mut self, raw: &[u8]) -> Result<Frame, FrameError> {
        self.record_at(raw, now_unix())
    }

    pub(crate) fn record_at(&mut self, raw: &[u8], now: i64) -> Result<Frame, FrameError> {
        match decode(raw) {
            Ok(frame) => {
                self.apply(&frame, now);
                Ok(frame)
            }
            Err(e) => {
                let data = self.data_mut();
                data.total_errors = data.total_errors.wrapping_add(1);
                debug!("store: rejected frame: {}", e);
                Err(e)
            }
        }
    }

    fn apply(&mut self, frame: &Frame, now: i64) {
        let record = Record::from_frame(frame, now);
        let tagged = TaggedFrame::from_record(&record);
        let data = self.data_mut();

        match record {
            Record::Environmental(s) => {
                data.latest_environmental = s;
                data.environmental_count = data.environmental_count.wrapping_add(1);
            }
            Record::LightRain(s) => {
                data.latest_light_rain = s;
                data.light_rain_count = data.light_rain_count.wrapping_add(1);
            }
            Record::SystemStatus(s) => {
                data.latest_system_status = s;
                data.system_status_count = data.system_status_count.wrapping_add(1);
            }
            Record::Gps(s) => {
                data.latest_gps = s;
                data.gps_count = data.gps_count.wrapping_add(1);
            }
        }
        data.latest = tagged;

        let idx = data.history_write_index as usize % MAX_HISTORY_COUNT;
        data.history[idx] = tagged;
        data.history_write_index = ((idx + 1) % MAX_HISTORY_COUNT) as u32;
        if (data.history_count as usize) < MAX_HISTORY_COUNT {
            data.history_count += 1;
        }

        data.total_received = data.total_received.wrapping_add(1);
        data.last_update_time = now;
        data.update_counter = data.update_counter.wrapping_add(1);
    }

    /// Mark the segment as abandoned and unlink it.
    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let pid = std::process::id();
        let data = self.data_mut();
        data.connection_status = ConnectionStatus::Disconnected as u8;
        data.writer_pid = 0;
        write_cstr(&mut data.last_error, &format!("receiver exited (pid {})", pid));
        data.last_update_time = now_unix();
        info!("store: segment {} released", self.region.path().display());
    }

    /// Frames currently counted in the history ring.
    pub fn history_len(&self) -> usize {
        (self.data().history_count as usize).min(MAX_HISTORY_COUNT)
    }

    /// Accepted frames of one variant.
    pub fn kind_count(&self, kind: FrameKind) -> u32 {
        let d = self.data();
        match kind {
            FrameKind::Environmental => d.environmental_count,
            FrameKind::LightRain => d.light_rain_count,
            FrameKind::SystemStatus => d.system_status_count,
            FrameKind::Gps => d.gps_count,
        }
    }
}

impl Drop for TelemetryStore {
    fn drop(&mut self) {
        self.finish();
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meteo_proto::frame::{Environmental, Gps, LightRain, SystemStatus};
    use meteo_proto::{Payload, FRAME_LEN};

    fn env(t: i16) -> [u8; FRAME_LEN] {
        let reading = Environmental { temp_c100: t, pressure_hpa10: 10132, humidity_pct100: 4550 };
        Frame::new(5, Payload::Environmental(reading)).encode()
    }

    fn open() -> (tempfile::TempDir, TelemetryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TelemetryStore::open(dir.path().join("telemetry")).unwrap();
        (dir, store)
    }

    #[test]
    fn fresh_segment_is_initialised() {
        let (_dir, store) = open();
        let d = store.data();
        assert_eq!(d.magic, SHARED_MEMORY_MAGIC);
        assert_eq!(d.writer_pid, std::process::id());
        assert_eq!(d.update_counter, 0);
        assert_eq!(store.connection_status(), Some(ConnectionStatus::Disconnected));
        assert!(d.latest.record().is_none());
    }

    #[test]
    fn accepted_frame_updates_every_view() {
        let (_dir, mut store) = open();
        store.record_at(&env(2345), 1_700_000_000).unwrap();

        let d = store.data();
        assert_eq!(d.update_counter, 1);
        assert_eq!(d.total_received, 1);
        assert_eq!(d.environmental_count, 1);
        assert_eq!(d.latest_environmental.valid, 1);
        assert_eq!(d.latest_environmental.node_id, 5);
        assert_eq!(d.latest_environmental.timestamp, 1_700_000_000);
        assert!((d.latest_environmental.temperature_c - 23.45).abs() < 0.005);
        assert!((d.latest_environmental.pressure_hpa - 1013.2).abs() < 0.05);
        assert!(matches!(d.latest.record(), Some(Record::Environmental(_))));
        assert_eq!(store.history_len(), 1);
        assert_eq!(d.last_update_time, 1_700_000_000);
    }

    #[test]
    fn rejected_frame_only_counts_an_error() {
        let (_dir, mut store) = open();
        store.record(&env(1000)).unwrap();
        let before = store.data().latest_environmental;

        let mut bad = env(3000);
        bad[9] ^= 0xFF;
        assert!(store.record(&bad).is_err());

        let d = store.data();
        assert_eq!(d.total_errors, 1);
        assert_eq!(d.update_counter, 1);
        assert_eq!(d.total_received, 1);
        assert_eq!(d.latest_environmental, before);
        assert_eq!(store.history_len(), 1);
    }

    #[test]
    fn unknown_command_counts_an_error() {
        let (_dir, mut store) = open();
        let mut raw = [0u8; FRAME_LEN];
        raw[0] = 1;
        raw[1] = 0x09;
        assert!(matches!(store.record(&raw), Err(FrameError::UnknownCommand { .. })));
        assert_eq!(store.update_counter(), 0);
        assert_eq!(store.total_errors(), 1);
    }

    #[test]
    fn each_variant_lands_in_its_slot() {
        let (_dir, mut store) = open();
        let frames = [
            Frame::new(1, Payload::LightRain(LightRain { lux10: 4321, rainfall_pct: 80 })),
            Frame::new(2, Payload::SystemStatus(SystemStatus {
                bme280: 0, bh1750: 1, rain_sensor: 0, i2c_bus: 0,
                uptime_s: 3600, total_errors: 4, reserved: 0,
            })),
            Frame::new(3, Payload::Gps(Gps {
                utc: *b"081530", lat_1e5: 3_990_420, lon_1e5: 11_640_740,
                fix_mode: 3, satellites: 8, hdop10: 9, alt10: 435,
            })),
        ];
        for f in &frames {
            store.record_at(&f.encode(), 42).unwrap();
        }
        let d = store.data();
        assert!((d.latest_light_rain.light_lux - 432.1).abs() < 0.05);
        assert_eq!(d.latest_light_rain.rainfall_pct, 80);
        assert_eq!(d.latest_system_status.bh1750_status, 1);
        assert_eq!(d.latest_system_status.uptime_s, 3600);
        assert_eq!(d.latest_gps.utc_str(), "081530");
        assert!((d.latest_gps.longitude - 116.4074).abs() < 1e-6);
        assert!(matches!(d.latest.record(), Some(Record::Gps(_))));
        assert_eq!(d.latest_environmental.valid, 0);
        for kind in [FrameKind::LightRain, FrameKind::SystemStatus, FrameKind::Gps] {
            assert_eq!(store.kind_count(kind), 1);
        }
        assert_eq!(store.kind_count(FrameKind::Environmental), 0);
        assert_eq!(store.update_counter(), 3);
    }

    #[test]
    fn history_saturates_and_wraps() {
        let (_dir, mut store) = open();
        for i in 0..101i16 {
            store.record_at(&env(i), i as i64).unwrap();
        }
        let d = store.data();
        assert_eq!(d.history_count, 100);
        assert_eq!(d.history_write_index, 1);
        // slot 0 was overwritten by the 101st frame
        assert_eq!(d.history[0].record().unwrap().timestamp(), 100);
        assert_eq!(d.history[1].record().unwrap().timestamp(), 1);
        assert_eq!(d.update_counter, 101);
    }

    #[test]
    fn reopen_keeps_live_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry");
        let mut first = TelemetryStore::open(&path).unwrap();
        first.record(&env(100)).unwrap();
        // a second writer attaching to the same live segment must not wipe it
        let second = TelemetryStore::open(&path).unwrap();
        assert_eq!(second.update_counter(), 1);
        std::mem::forget(first);
    }

    #[test]
    fn close_marks_segment_abandoned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry");
        let mut store = TelemetryStore::open(&path).unwrap();
        store.set_connection_status(ConnectionStatus::Connected);
        let reader = SharedRegion::open_read_only(&path).unwrap();
        store.close();
        // SAFETY: reader maps the full segment
        let d = unsafe { &*(reader.as_ptr() as *const SharedTelemetry) };
        assert_eq!(d.connection_status, ConnectionStatus::Disconnected as u8);
        assert_eq!(d.writer_pid, 0);
        assert!(crate::layout::nul_terminated(&d.last_error).starts_with("receiver exited"));
        assert!(!path.exists());
    }

    #[test]
    fn peer_and_error_text_are_recorded() {
        let (_dir, mut store) = open();
        store.set_peer("192.168.100.200", 8889);
        store.set_last_error("connect failed: refused");
        let d = store.data();
        assert_eq!(crate::layout::nul_terminated(&d.server_ip), "192.168.100.200");
        assert_eq!(d.server_port, 8889);
        assert_eq!(crate::layout::nul_terminated(&d.last_error), "connect failed: refused");
    }
}
