//! Cross-process telemetry segment.
//!
//! One receiver process owns a [`TelemetryStore`] and applies validated frames to a
//! fixed `#[repr(C)]` layout mapped from a file under `/dev/shm`. Any number of
//! display processes attach with [`StoreReader`] and copy snapshots out.

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

pub mod doctor;
pub mod layout;
pub mod reader;
mod shm;
pub mod store;

pub use layout::{
    ConnectionStatus, Record, SharedTelemetry, MAX_HISTORY_COUNT, SHARED_MEMORY_MAGIC,
    SHARED_MEMORY_SIZE,
};
pub use reader::{Snapshot, Stats, StoreReader};
pub use store::TelemetryStore;

pub const DEFAULT_STORE_PATH: &str = "/dev/shm/meteo-telemetry";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    pub path: Option<String>,
}

impl StoreConfig {
    pub fn path(&self) -> PathBuf {
        PathBuf::from(self.path.as_deref().unwrap_or(DEFAULT_STORE_PATH))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot map segment {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("segment is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("bad segment magic {0:#010x}")]
    BadMagic(u32),
}
