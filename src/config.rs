//! YAML configuration consumed at startup.
//!
//! All routing authority lives here: the fleet, and each backend's declared
//! migration status and phase. Unknown status or phase tokens fail the load;
//! omitted ones default to a steady `normal`/`rw` backend.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::ring::{Phase, Status};
use crate::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
}

/// One backend entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub phase: Phase,
}

impl Config {
    /// Load and parse the config file.
    pub fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config = serde_yaml::from_str(&text).map_err(ConfigError::Parse)?;
        Ok(config)
    }
}
