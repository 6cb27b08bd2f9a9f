use anyhow::Result;
use std::net::SocketAddr;

use crate::RelayConfig;

pub fn check_relay(cfg: &RelayConfig) -> Result<()> {
    let addr: SocketAddr = cfg.listen.parse()
        .map_err(|e| anyhow::anyhow!("relay.listen invalid ({}): {}", cfg.listen, e))?;
    anyhow::ensure!(addr.port() != 0, "relay.listen needs a fixed port");
    if let Some(n) = cfg.max_receivers {
        anyhow::ensure!((1..=1024).contains(&n), "relay.max_receivers should be 1..1024");
    }
    Ok(())
}
