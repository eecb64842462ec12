//! Server configuration.
//!
//! Defaults match the production instrument; a TOML file can override any
//! field and the CLI can override the listen address on top of that.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the WebSocket control plane listens on.
    pub listen_addr: String,

    /// Device path the "auto" motor port alias resolves to.
    pub motor_port: String,

    /// Ohmmeter RS-485 adapter.
    pub ohmmeter_port: String,

    /// I²C bus carrying the tip EEPROM.
    pub i2c_bus: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: "0.0.0.0:8765".to_owned(),
            motor_port: "/dev/usb-motor".to_owned(),
            ohmmeter_port: "/dev/usb-resistance".to_owned(),
            i2c_bus: 1,
        }
    }
}

impl Config {
    /// Load from a TOML file. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}
