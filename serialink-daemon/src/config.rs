use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::bluetooth::SERIAL_PORT_UUID;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    pub socket_path: String,
    #[serde(default)]
    pub bluetooth: BluetoothConfig,
    #[serde(default)]
    pub serial: SerialConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Adapter used when a scan command does not name one
    pub adapter: String,
    pub pin_code: String,
    pub agent_capability: String,
    pub profile_uuid: String,
    pub profile_role: String,
    pub pair_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// How long to wait for the RFCOMM socket once ConnectProfile returned
    pub socket_wait_secs: u64,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SerialConfig {
    pub write_encoding: WriteEncoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteEncoding {
    /// Low byte of every UTF-16 code unit
    Ascii,
    Utf8,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: "/run/serialink/serialink.sock".to_string(),
            bluetooth: BluetoothConfig::default(),
            serial: SerialConfig::default(),
        }
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            adapter: "hci0".to_string(),
            pin_code: "1234".to_string(),
            agent_capability: "KeyboardDisplay".to_string(),
            profile_uuid: SERIAL_PORT_UUID.to_string(),
            profile_role: "client".to_string(),
            pair_timeout_secs: 30,
            connect_timeout_secs: 15,
            socket_wait_secs: 5,
            shutdown_timeout_secs: 5,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            write_encoding: WriteEncoding::Ascii,
        }
    }
}

impl BluetoothConfig {
    pub fn pair_timeout(&self) -> Duration {
        Duration::from_secs(self.pair_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn socket_wait(&self) -> Duration {
        Duration::from_secs(self.socket_wait_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl DaemonConfig {
    pub fn load(path: &str) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(_) => {
                // Create default config if not found
                let config = Self::default();
                if let Err(e) = fs::write(path, toml::to_string_pretty(&config)?) {
                    tracing::debug!("Could not write default config to {}: {}", path, e);
                }
                Ok(config)
            }
        }
    }
}
