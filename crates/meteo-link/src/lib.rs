pub mod doctor;
pub mod sink;

pub use sink::{CsvSink, FrameSink, PersistenceConfig};

use anyhow::{Context, Result};
pub use meteo_proto::Shutdown;

use meteo_proto::{read_raw_frame, shutdown_requested, write_full, Payload, Role, FRAME_LEN};
use meteo_store::{ConnectionStatus, TelemetryStore};
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub const DEFAULT_PORT: u16 = 8889;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// Relay host or IP.
    pub server: String,
    pub port: Option<u16>,
    /// Fixed wait between connection attempts. Default 5 s.
    pub reconnect_delay_ms: Option<u64>,
}

impl LinkConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms.unwrap_or(DEFAULT_RECONNECT_DELAY_MS))
    }
}

#[derive(Debug, Clone, Default)]
pub struct LinkHealth {
    pub sessions: u32,
    pub consecutive_failures: u32,
    pub frames_accepted: u64,
    pub frames_rejected: u64,
}

enum SessionEnd {
    Shutdown,
    PeerClosed,
}

/// Receiver side of the relay: feeds every frame it hears into the telemetry store.
pub struct Link {
    cfg: LinkConfig,
    store: TelemetryStore,
    sink: Option<Box<dyn FrameSink + Send>>,
    health: LinkHealth,
}

impl Link {
    pub fn new(cfg: LinkConfig, mut store: TelemetryStore) -> Self {
        store.set_peer(&cfg.server, cfg.port());
        Self { cfg, store, sink: None, health: LinkHealth::default() }
    }

    pub fn with_sink(mut self, sink: impl FrameSink + Send + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn health(&self) -> &LinkHealth {
        &self.health
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.store
    }

    pub fn into_store(self) -> TelemetryStore {
        self.store
    }

    /// Connect, listen and reconnect after a fixed delay until shutdown.
    pub async fn run(&mut self, mut shutdown: Shutdown) -> Result<()> {
        let delay = self.cfg.reconnect_delay();
        loop {
            self.store.set_connection_status(ConnectionStatus::Connecting);
            let cause = match self.session(&mut shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::PeerClosed) => "relay closed the connection".to_string(),
                Err(e) => format!("{:#}", e),
            };
            self.health.consecutive_failures += 1;
            self.store.set_connection_status(ConnectionStatus::Disconnected);
            self.store.set_last_error(&cause);
            warn!(
                "link: {} (failures: {}), retrying in {:?}",
                cause, self.health.consecutive_failures, delay
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        self.store.set_connection_status(ConnectionStatus::Disconnected);
        info!(
            "link: stopped (accepted={}, rejected={}, store total={})",
            self.health.frames_accepted,
            self.health.frames_rejected,
            self.store.total_received()
        );
        Ok(())
    }

    async fn session(&mut self, shutdown: &mut Shutdown) -> Result<SessionEnd> {
        let addr = format!("{}:{}", self.cfg.server, self.cfg.port());
        info!("link: connecting to {}", addr);
        let mut stream = tokio::select! {
            res = TcpStream::connect(&addr) => res.with_context(|| format!("connect {}", addr))?,
            _ = shutdown_requested(shutdown) => return Ok(SessionEnd::Shutdown),
        };
        write_full(&mut stream, &Role::Receiver.tag()).await.context("send role")?;

        self.health.sessions += 1;
        self.health.consecutive_failures = 0;
        self.store.set_connection_status(ConnectionStatus::Connected);
        self.store.set_last_error("handshake ok");
        info!("link: connected to {}", addr);

        loop {
            let res = tokio::select! {
                res = read_raw_frame(&mut stream) => res,
                _ = shutdown_requested(shutdown) => return Ok(SessionEnd::Shutdown),
            };
            match res.context("read frame")? {
                Some(raw) => self.ingest(&raw),
                None => return Ok(SessionEnd::PeerClosed),
            }
        }
    }

    /// Malformed frames are counted by the store and never end the session.
    fn ingest(&mut self, raw: &[u8; FRAME_LEN]) {
        match self.store.record(raw) {
            Ok(frame) => {
                self.health.frames_accepted += 1;
                debug!("link: node {} {}", frame.node_id, frame.kind().label());
                if let Payload::SystemStatus(s) = &frame.payload {
                    if !s.all_ok() {
                        warn!(
                            "link: node {} reports faults (bme280={} bh1750={} rain={} i2c={})",
                            frame.node_id, s.bme280, s.bh1750, s.rain_sensor, s.i2c_bus
                        );
                    }
                }
                if let Some(sink) = self.sink.as_mut() {
                    if let Err(e) = sink.persist(&frame) {
                        warn!("link: persistence failed: {:#}", e);
                    }
                }
            }
            Err(e) => {
                self.health.frames_rejected += 1;
                debug!("link: rejected frame: {}", e);
            }
        }
    }
}
