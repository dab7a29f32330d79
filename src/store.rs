//! Tunnel definitions on disk, as a TOML `[[tunnel]]` array.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::tunnel::TunnelConfig;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TunnelFile {
    #[serde(default, rename = "tunnel")]
    tunnels: Vec<TunnelConfig>,
}

/// Load every tunnel in `path`. A missing file means no tunnels yet.
pub fn load_tunnels(path: &Path) -> Result<Vec<TunnelConfig>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let file: TunnelFile = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(file.tunnels)
}

/// Write `tunnels` to `path`, replacing its contents.
///
/// `is_active` is runtime state and is always stored as false.
pub fn save_tunnels(path: &Path, tunnels: &[TunnelConfig]) -> Result<()> {
    let file = TunnelFile {
        tunnels: tunnels
            .iter()
            .cloned()
            .map(|mut t| {
                t.is_active = false;
                t
            })
            .collect(),
    };
    let content = toml::to_string_pretty(&file).context("failed to serialize tunnels")?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
