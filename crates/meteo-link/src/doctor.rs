use anyhow::Result;

use crate::LinkConfig;

pub fn check_link(cfg: &LinkConfig) -> Result<()> {
    anyhow::ensure!(!cfg.server.trim().is_empty(), "receiver.server is empty");
    anyhow::ensure!(cfg.port() != 0, "receiver.port must be non-zero");
    let delay = cfg.reconnect_delay().as_millis();
    anyhow::ensure!(
        (100..=600_000).contains(&delay),
        "receiver.reconnect_delay_ms out of range (100..=600000): {}",
        delay
    );
    Ok(())
}
