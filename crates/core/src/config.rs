//! Engine configuration
//!
//! Loaded from `relayplay.toml`. Every key is optional; missing keys fall
//! back to the reference timings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pid::DEFAULT_ALLOCATION_ATTEMPTS;

/// Name of the configuration file inside the platform config directory
pub const CONFIG_FILE_NAME: &str = "relayplay.toml";

/// Tunables shared by the client, server and provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deadline for every blocking wait, in milliseconds
    pub connect_timeout_ms: u64,
    /// Pause between pumps inside a wait, in milliseconds
    pub poll_interval_ms: u64,
    /// Server tick loop frequency
    pub tick_rate_hz: u32,
    /// Messages drained from the server poll group per tick
    pub server_receive_batch: usize,
    /// Messages drained from the client connection per pump
    pub client_receive_batch: usize,
    /// Draws before PID allocation gives up
    pub pid_allocation_attempts: usize,
    /// Idle threshold reported for server connection records
    pub client_timeout_secs: u64,
    /// Product name advertised by hosted servers
    pub product_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            poll_interval_ms: 5,
            tick_rate_hz: 60,
            server_receive_batch: 128,
            client_receive_batch: 64,
            pid_allocation_attempts: DEFAULT_ALLOCATION_ATTEMPTS,
            client_timeout_secs: 50,
            product_name: "RedirectPlay".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load from a file, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded engine config");
        Ok(config)
    }

    /// `relayplay.toml` inside the platform config directory
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "redirectplay", "relayplay")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate_hz.max(1)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.tick_rate_hz, 60);
        assert_eq!(config.pid_allocation_attempts, 1000);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
connect_timeout_ms = 2500
product_name = "Test Game"
"#,
        )
        .unwrap();

        assert_eq!(config.connect_timeout_ms, 2500);
        assert_eq!(config.product_name, "Test Game");
        assert_eq!(config.server_receive_batch, 128);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(EngineConfig::from_toml_str("tick_rate_hz = \"fast\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);

        // Missing file falls back to defaults
        assert_eq!(EngineConfig::load(&path).unwrap(), EngineConfig::default());

        fs::write(&path, "tick_rate_hz = 30\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.tick_rate_hz, 30);
        assert_eq!(config.tick_duration(), Duration::from_secs(1) / 30);
    }
}
