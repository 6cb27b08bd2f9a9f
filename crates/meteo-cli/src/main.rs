use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};

use meteo_link::{doctor as link_doctor, CsvSink, Link, LinkConfig, PersistenceConfig};
use meteo_proto::{shutdown_requested, Shutdown};
use meteo_relay::{doctor as relay_doctor, RelayConfig, RelayServer};
use meteo_store::{
    doctor as store_doctor, Record, Snapshot, StoreConfig, StoreReader, TelemetryStore,
};

#[derive(Debug, Parser)]
#[command(
    name = "meteo",
    version,
    about = "Meteorological telemetry relay, receiver and store inspector"
)]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration.
    Doctor,
    /// Run the TCP relay.
    Relay,
    /// Connect to the relay as a receiver and publish frames to shared memory.
    Receive,
    /// Print the shared-memory store.
    Status {
        /// Number of history entries to print, newest last.
        #[arg(long, default_value_t = 10)]
        history: usize,
        /// Keep printing whenever the store changes.
        #[arg(long)]
        watch: bool,
    },
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    relay: Option<RelayConfig>,
    receiver: Option<LinkConfig>,
    store: Option<StoreConfig>,
    persistence: Option<PersistenceConfig>,
}

impl Config {
    fn store(&self) -> StoreConfig {
        self.store.clone().unwrap_or_default()
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Relay => relay(&cfg).await?,
        Command::Receive => receive(&cfg).await?,
        Command::Status { history, watch } => status(&cfg, history, watch).await?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    anyhow::ensure!(
        cfg.relay.is_some() || cfg.receiver.is_some(),
        "config needs a [relay] or [receiver] section"
    );
    if let Some(r) = &cfg.relay {
        relay_doctor::check_relay(r)?;
    }
    if let Some(l) = &cfg.receiver {
        link_doctor::check_link(l)?;
    }
    store_doctor::check_store(&cfg.store())?;
    if let Some(p) = cfg.persistence.as_ref().filter(|p| p.enable) {
        let parent = Path::new(&p.csv_path).parent().filter(|d| !d.as_os_str().is_empty());
        if let Some(dir) = parent {
            anyhow::ensure!(
                dir.is_dir(),
                "persistence.csv_path directory missing: {}",
                dir.display()
            );
        }
    }
    info!("doctor: OK");
    Ok(())
}

/// Flips to `true` on SIGINT or SIGTERM.
fn shutdown_on_signal() -> Result<Shutdown> {
    let (tx, rx) = watch::channel(false);
    let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!("ctrl-c handler failed: {}", e);
                }
            }
            _ = term.recv() => {}
        }
        info!("shutdown requested");
        let _ = tx.send(true);
        // keep the sender alive so receivers see `true` rather than a closed channel
        std::future::pending::<()>().await;
    });
    Ok(rx)
}

async fn relay(cfg: &Config) -> Result<()> {
    let rcfg = cfg.relay.as_ref().context("no [relay] config section")?;
    let server = RelayServer::bind(rcfg).await?;
    let shutdown = shutdown_on_signal()?;
    server.serve(shutdown).await
}

async fn receive(cfg: &Config) -> Result<()> {
    let lcfg = cfg.receiver.clone().context("no [receiver] config section")?;
    let path = cfg.store().path();
    let store = TelemetryStore::open(&path)
        .with_context(|| format!("open store {}", path.display()))?;
    info!("receive: publishing to {}", path.display());

    let mut link = Link::new(lcfg, store);
    if let Some(p) = cfg.persistence.as_ref().filter(|p| p.enable) {
        link = link.with_sink(CsvSink::open(&p.csv_path)?);
        info!("receive: logging frames to {}", p.csv_path);
    }

    let shutdown = shutdown_on_signal()?;
    let res = link.run(shutdown).await;
    link.into_store().close();
    res
}

async fn status(cfg: &Config, history: usize, watch: bool) -> Result<()> {
    let path = cfg.store().path();
    let reader = StoreReader::attach(&path)
        .with_context(|| format!("attach store {}", path.display()))?;
    let mut last_seen = reader.update_counter();
    print_snapshot(&reader.snapshot(), history);
    if !watch {
        return Ok(());
    }

    let mut shutdown = shutdown_on_signal()?;
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown_requested(&mut shutdown) => break,
        }
        if let Some(snap) = reader.poll(&mut last_seen) {
            println!();
            print_snapshot(&snap, history);
        }
    }
    Ok(())
}

fn fmt_unix(ts: i64) -> String {
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| ts.to_string())
}

fn print_snapshot(snap: &Snapshot, history: usize) {
    let status = snap
        .connection_status()
        .map(|s| format!("{:?}", s))
        .unwrap_or_else(|| "Unknown".into());
    let server = snap
        .server()
        .map(|(ip, port)| format!("{}:{}", ip, port))
        .unwrap_or_else(|| "-".into());
    println!(
        "status={} writer_pid={:?} server={} updates={}",
        status,
        snap.writer_pid(),
        server,
        snap.update_counter()
    );

    let st = snap.stats();
    println!(
        "received={} errors={} bme280={} light_rain={} system={} gps={}",
        st.total_received,
        st.total_errors,
        st.environmental,
        st.light_rain,
        st.system_status,
        st.gps
    );
    println!(
        "last_update={} last_error={:?}",
        fmt_unix(snap.last_update_time()),
        snap.last_error()
    );

    if let Some(s) = snap.latest_environmental() {
        println!("{}", describe(&Record::Environmental(s)));
    }
    if let Some(s) = snap.latest_light_rain() {
        println!("{}", describe(&Record::LightRain(s)));
    }
    if let Some(s) = snap.latest_system_status() {
        println!("{}", describe(&Record::SystemStatus(s)));
    }
    if let Some(s) = snap.latest_gps() {
        println!("{}", describe(&Record::Gps(s)));
    }

    if history > 0 {
        let all = snap.history();
        let skip = all.len().saturating_sub(history);
        println!("history ({} of {}):", all.len() - skip, all.len());
        for rec in &all[skip..] {
            println!("  {}", describe(rec));
        }
    }
}

fn describe(rec: &Record) -> String {
    let head = format!(
        "{} {:<9} node={:<3}",
        fmt_unix(rec.timestamp()),
        rec.kind().label(),
        rec.node_id()
    );
    match rec {
        Record::Environmental(s) => format!(
            "{} temp={:.2}C pressure={:.1}hPa humidity={:.2}%",
            head, s.temperature_c, s.pressure_hpa, s.humidity_pct
        ),
        Record::LightRain(s) => format!("{} lux={:.1} rain={}%", head, s.light_lux, s.rainfall_pct),
        Record::SystemStatus(s) => format!(
            "{} bme280={} bh1750={} rain={} i2c={} uptime={}s errors={}",
            head,
            s.bme280_status,
            s.bh1750_status,
            s.rain_sensor_status,
            s.i2c_bus_status,
            s.uptime_s,
            s.total_errors
        ),
        Record::Gps(s) => format!(
            "{} utc={} lat={:.5} lon={:.5} fix={} sats={} hdop={:.1} alt={:.1}m",
            head,
            s.utc_str(),
            s.latitude,
            s.longitude,
            s.fix_mode,
            s.satellites,
            s.hdop,
            s.altitude_m
        ),
    }
}
