use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Presenter configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenterConfig {
    /// Relay address (host:port).
    pub relay: String,

    /// Free-text name shown to viewers.
    pub display_name: String,

    /// Capture settings.
    pub capture: CaptureConfig,

    /// Encoding settings.
    pub encode: EncodeConfig,

    /// Privileged recorder settings.
    pub recorder: RecorderConfig,
}

/// Screen capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Target frames per second, 10..=120.
    pub target_fps: u32,
}

/// Frame encoding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeConfig {
    /// JPEG quality, 1..=100.
    pub jpeg_quality: u8,
}

/// Privileged recorder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Recorder session id; empty disables the recorder grabber.
    pub session_id: String,

    /// Directory holding recorder session pipes.
    pub pipe_dir: String,
}

impl Default for PresenterConfig {
    fn default() -> Self {
        Self {
            relay: "127.0.0.1:9550".to_string(),
            display_name: String::new(),
            capture: CaptureConfig::default(),
            encode: EncodeConfig::default(),
            recorder: RecorderConfig::default(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { target_fps: 30 }
    }
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self { jpeg_quality: 75 }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            pipe_dir: "/run/glimpse".to_string(),
        }
    }
}

/// Load configuration; defaults apply when `path` is `None`.
pub fn load(path: Option<&Path>) -> Result<PresenterConfig> {
    let Some(path) = path else {
        return Ok(PresenterConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config from {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid config in {}", path.display()))
}
