use anyhow::{Context, Result};
use meteo_proto::{Frame, Payload};
use serde::Deserialize;
use std::fs::{File, OpenOptions};
use std::path::Path;
use time::macros::format_description;
use time::OffsetDateTime;

/// Somewhere to keep validated frames beyond the shared segment.
pub trait FrameSink {
    fn persist(&mut self, frame: &Frame) -> Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    pub enable: bool,
    /// Appended to, one line per frame.
    pub csv_path: String,
}

/// Appends `type,node_id,local_time,fields...` lines and syncs after each one.
pub struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open csv log {}", path.display()))?;
        let writer = csv::WriterBuilder::new().has_headers(false).flexible(true).from_writer(file);
        Ok(Self { writer })
    }
}

impl FrameSink for CsvSink {
    fn persist(&mut self, frame: &Frame) -> Result<()> {
        let record = csv_fields(frame, &local_time()?);
        self.writer.write_record(&record)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

fn local_time() -> Result<String> {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    Ok(now.format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))?)
}

/// One CSV row. System health flags are written as 1 when the component reports OK.
pub fn csv_fields(frame: &Frame, ts: &str) -> Vec<String> {
    let mut row = vec![frame.kind().label().to_string(), frame.node_id.to_string(), ts.to_string()];
    match &frame.payload {
        Payload::Environmental(e) => row.extend([
            format!("{:.2}", e.temperature_c()),
            format!("{:.1}", e.pressure_hpa()),
            format!("{:.2}", e.humidity_pct()),
        ]),
        Payload::LightRain(l) => {
            row.extend([format!("{:.1}", l.lux()), l.rainfall_pct.to_string()])
        }
        Payload::SystemStatus(s) => {
            let ok = |v: u8| u8::from(v == 0).to_string();
            row.extend([
                ok(s.bme280),
                ok(s.bh1750),
                ok(s.rain_sensor),
                ok(s.i2c_bus),
                s.uptime_s.to_string(),
                s.total_errors.to_string(),
            ]);
        }
        Payload::Gps(g) => {
            let utc = match g.utc_hms() {
                Some((h, m, s)) => format!("{:02}:{:02}:{:02}", h, m, s),
                None => "--:--:--".to_string(),
            };
            row.extend([
                utc,
                format!("{:.5}", g.latitude()),
                format!("{:.5}", g.longitude()),
                g.fix_mode.to_string(),
                g.satellites.to_string(),
                format!("{:.1}", g.hdop()),
                format!("{:.1}", g.altitude_m()),
            ]);
        }
    }
    row
}
