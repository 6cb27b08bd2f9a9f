use anyhow::{bail, Result};

use crate::StoreConfig;

/// Check that the segment's directory exists and is a directory.
pub fn check_store(cfg: &StoreConfig) -> Result<()> {
    let path = cfg.path();
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        bail!("store.path {} has no parent directory", path.display());
    };
    if !parent.is_dir() {
        bail!("store directory {} does not exist", parent.display());
    }
    if path.is_dir() {
        bail!("store.path {} is a directory", path.display());
    }
    Ok(())
}
