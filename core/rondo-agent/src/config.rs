//! Agent configuration, read from `rondo.toml` in the data directory.
//! Any failure to read or parse falls back to safe defaults; a broken config
//! file must never keep the agent from starting.

use std::path::{Path, PathBuf};

use rondo_core::TravelMode;
use serde::Deserialize;
use tracing::warn;

pub const CONFIG_FILE: &str = "rondo.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigTravelMode {
    Walking,
    Driving,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Base url of the backend table store.
    pub backend_url: String,
    /// Application key sent with every request.
    pub application_key: String,
    /// Name shown to other participants.
    pub alias: String,
    /// Push endpoint uri for this device. Registration with the platform
    /// push service happens outside the agent; the resulting uri lands here.
    pub channel_uri: String,
    pub travel_mode: ConfigTravelMode,
    /// Device-type code reported to the backend.
    pub device_code: i32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend_url: "https://rondo.example.net".to_string(),
            application_key: String::new(),
            alias: "anonymous".to_string(),
            channel_uri: String::new(),
            travel_mode: ConfigTravelMode::Walking,
            device_code: 2,
        }
    }
}

impl AgentConfig {
    pub fn travel_mode(&self) -> TravelMode {
        match self.travel_mode {
            ConfigTravelMode::Walking => TravelMode::Walking,
            ConfigTravelMode::Driving => TravelMode::Driving,
        }
    }
}

/// Data directory for config, state snapshot, device id and logs.
pub fn data_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".rondo"))
}

pub fn load(path: &Path) -> AgentConfig {
    if !path.exists() {
        return AgentConfig::default();
    }

    let content = match fs_err::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!(error = %err, path = %path.display(), "failed to read config; using defaults");
            return AgentConfig::default();
        }
    };

    match toml::from_str(&content) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, path = %path.display(), "failed to parse config; using defaults");
            AgentConfig::default()
        }
    }
}
