use std::path::Path;

use crate::layout::{
    nul_terminated, ConnectionStatus, EnvironmentalSlot, GpsSlot, LightRainSlot, Record,
    SharedTelemetry, SystemStatusSlot, MAX_HISTORY_COUNT, SHARED_MEMORY_MAGIC, SHARED_MEMORY_SIZE,
};
use crate::shm::SharedRegion;
use crate::StoreError;

/// Read-only attachment to a segment owned by a receiver process.
///
/// There is no lock between writer and readers. A snapshot taken while a frame is
/// being applied may mix fields from two frames; callers that care re-check
/// `update_counter` and take another snapshot.
pub struct StoreReader {
    region: SharedRegion,
}

impl StoreReader {
    pub fn attach(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let region = SharedRegion::open_read_only(path)
            .map_err(|source| StoreError::Open { path: path.to_path_buf(), source })?;
        if region.len() != SHARED_MEMORY_SIZE {
            return Err(StoreError::SizeMismatch {
                expected: SHARED_MEMORY_SIZE,
                actual: region.len(),
            });
        }
        let reader = Self { region };
        let magic = reader.magic();
        if magic != SHARED_MEMORY_MAGIC {
            return Err(StoreError::BadMagic(magic));
        }
        Ok(reader)
    }

    fn raw(&self) -> *const SharedTelemetry {
        self.region.as_ptr() as *const SharedTelemetry
    }

    fn magic(&self) -> u32 {
        // SAFETY: region is SHARED_MEMORY_SIZE bytes; the writer may change it under us.
        unsafe { std::ptr::read_volatile(std::ptr::addr_of!((*self.raw()).magic)) }
    }

    pub fn update_counter(&self) -> u32 {
        // SAFETY: as in `magic`.
        unsafe { std::ptr::read_volatile(std::ptr::addr_of!((*self.raw()).update_counter)) }
    }

    /// Copy the whole segment out.
    pub fn snapshot(&self) -> Snapshot {
        // SAFETY: any bit pattern is a valid SharedTelemetry; a concurrent write can only
        // produce a torn copy, not an invalid one.
        let data = unsafe { std::ptr::read_volatile(self.raw()) };
        Snapshot { data: Box::new(data) }
    }

    /// Snapshot only if the writer applied a frame since `last_seen`.
    pub fn poll(&self, last_seen: &mut u32) -> Option<Snapshot> {
        let counter = self.update_counter();
        if counter == *last_seen {
            return None;
        }
        *last_seen = counter;
        Some(self.snapshot())
    }
}

/// Owned copy of the segment.
pub struct Snapshot {
    data: Box<SharedTelemetry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub total_received: u32,
    pub total_errors: u32,
    pub environmental: u32,
    pub light_rain: u32,
    pub system_status: u32,
    pub gps: u32,
}

impl Snapshot {
    pub fn update_counter(&self) -> u32 {
        self.data.update_counter
    }

    pub fn writer_pid(&self) -> Option<u32> {
        match self.data.writer_pid {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        ConnectionStatus::from_u8(self.data.connection_status)
    }

    pub fn latest(&self) -> Option<Record> {
        self.data.latest.record()
    }

    pub fn latest_environmental(&self) -> Option<EnvironmentalSlot> {
        Some(self.data.latest_environmental).filter(|s| s.valid != 0)
    }

    pub fn latest_light_rain(&self) -> Option<LightRainSlot> {
        Some(self.data.latest_light_rain).filter(|s| s.valid != 0)
    }

    pub fn latest_system_status(&self) -> Option<SystemStatusSlot> {
        Some(self.data.latest_system_status).filter(|s| s.valid != 0)
    }

    pub fn latest_gps(&self) -> Option<GpsSlot> {
        Some(self.data.latest_gps).filter(|s| s.valid != 0)
    }

    /// History ring, oldest first.
    pub fn history(&self) -> Vec<Record> {
        let count = (self.data.history_count as usize).min(MAX_HISTORY_COUNT);
        let next = self.data.history_write_index as usize % MAX_HISTORY_COUNT;
        let start = (next + MAX_HISTORY_COUNT - count) % MAX_HISTORY_COUNT;
        (0..count)
            .filter_map(|i| self.data.history[(start + i) % MAX_HISTORY_COUNT].record())
            .collect()
    }

    pub fn last_error(&self) -> &str {
        nul_terminated(&self.data.last_error)
    }

    pub fn last_update_time(&self) -> i64 {
        self.data.last_update_time
    }

    /// Relay address the writer was configured with, if any.
    pub fn server(&self) -> Option<(&str, u16)> {
        let ip = nul_terminated(&self.data.server_ip);
        if ip.is_empty() {
            None
        } else {
            Some((ip, self.data.server_port))
        }
    }

    pub fn stats(&self) -> Stats {
        let d = &self.data;
        Stats {
            total_received: d.total_received,
            total_errors: d.total_errors,
            environmental: d.environmental_count,
            light_rain: d.light_rain_count,
            system_status: d.system_status_count,
            gps: d.gps_count,
        }
    }
}
