use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Relay configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Network bind address and port.
    pub bind: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9550".to_string(),
        }
    }
}

/// Load configuration; defaults apply when `path` is `None`.
pub fn load(path: Option<&Path>) -> Result<RelayConfig> {
    let Some(path) = path else {
        return Ok(RelayConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config from {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid config in {}", path.display()))
}
