// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading relay settings. Nothing is ever written back to disk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Relay engine settings.
    pub relay: RelayConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// RFCOMM channel of the secure service.
    pub secure_channel: u8,

    /// RFCOMM channel of the insecure service.
    pub insecure_channel: u8,

    /// Dial peers in secure mode.
    pub secure: bool,

    /// Adapter name (e.g. "hci0"); the default adapter when unset.
    pub adapter: Option<String>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            secure_channel: 3,
            insecure_channel: 4,
            secure: true,
            adapter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Bytes requested per socket read. Each read is relayed as one message.
    pub read_buffer_size: usize,

    /// Capacity of the relay event channel.
    pub event_capacity: usize,

    /// Drop a link on its first failed write instead of waiting for its
    /// receive loop to notice the disconnect.
    pub evict_on_write_error: bool,

    /// Peers the daemon dials at startup, in order.
    pub peers: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
            event_capacity: 64,
            evict_on_write_error: false,
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level for the relay's own log target.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rfcomm-relay")
            .join("config.toml")
    }

    /// Load configuration from the default location, or defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        debug!("Reading config from {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, channel) in [
            ("secure_channel", self.bluetooth.secure_channel),
            ("insecure_channel", self.bluetooth.insecure_channel),
        ] {
            if !(1..=30).contains(&channel) {
                anyhow::bail!("bluetooth.{} must be in 1..=30, got {}", name, channel);
            }
        }
        if self.bluetooth.secure_channel == self.bluetooth.insecure_channel {
            anyhow::bail!("secure and insecure services need distinct channels");
        }
        if self.relay.read_buffer_size == 0 {
            anyhow::bail!("relay.read_buffer_size must be positive");
        }
        if self.relay.event_capacity == 0 {
            anyhow::bail!("relay.event_capacity must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.relay.read_buffer_size, 1024);
        assert!(config.bluetooth.secure);
        assert!(!config.relay.evict_on_write_error);
        assert!(!dir.path().join("absent.toml").exists());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[relay]\npeers = [\"AA:BB:CC:DD:EE:01\", \"AA:BB:CC:DD:EE:02\"]\nevict_on_write_error = true\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.relay.peers.len(), 2);
        assert!(config.relay.evict_on_write_error);
        assert_eq!(config.relay.event_capacity, 64);
        assert_eq!(config.bluetooth.secure_channel, 3);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_rejects_shared_channel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[bluetooth]\nsecure_channel = 5\ninsecure_channel = 5\n").unwrap();

        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[relay\nread_buffer_size = ").unwrap();

        assert!(Config::load_from(&path).is_err());
    }
}
