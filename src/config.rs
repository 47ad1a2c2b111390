// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Configuration management.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const CONFIG_FILE: &str = "soundman.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("No config directory found")]
    NoConfigDir,
}

/// Connection and bridge settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoundmanConfig {
    /// Client name announced to the audio server.
    #[serde(default = "default_application_name")]
    pub application_name: String,
    /// Server address. `None` lets the client library pick its default.
    #[serde(default)]
    pub server: Option<String>,
    /// Longest idle sleep of the worker between two dispatch passes.
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    /// Deadline for a single blocking call. Unset means wait until the
    /// server answers or the connection ends.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}

fn default_application_name() -> String {
    "Sound Manager".to_string()
}

fn default_dispatch_interval_ms() -> u64 {
    5
}

impl Default for SoundmanConfig {
    fn default() -> Self {
        Self {
            application_name: default_application_name(),
            server: None,
            dispatch_interval_ms: default_dispatch_interval_ms(),
            call_timeout_ms: None,
        }
    }
}

impl SoundmanConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms.max(1))
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

/// Configuration manager handles loading and saving the config file.
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Create a config manager rooted at the platform config directory.
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = directories::ProjectDirs::from("org", "soundman", "soundman")
            .map(|d| d.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)?;

        Self::with_dir(config_dir)
    }

    /// Create a config manager rooted at an explicit directory.
    pub fn with_dir(config_dir: PathBuf) -> Result<Self, ConfigError> {
        fs::create_dir_all(&config_dir)?;

        debug!("Config directory: {:?}", config_dir);
        Ok(Self { config_dir })
    }

    fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Load the configuration, falling back to defaults when no file exists.
    pub fn load(&self) -> Result<SoundmanConfig, ConfigError> {
        let path = self.config_path();
        if !path.exists() {
            debug!("No config found, using defaults");
            return Ok(SoundmanConfig::default());
        }

        let content = fs::read_to_string(&path)?;
        let config = SoundmanConfig::from_toml(&content)?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save the configuration.
    pub fn save(&self, config: &SoundmanConfig) -> Result<(), ConfigError> {
        let path = self.config_path();
        let content = config.to_toml()?;
        fs::write(&path, content)?;
        debug!("Saved config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = SoundmanConfig::from_toml("").unwrap();
        assert_eq!(config, SoundmanConfig::default());
        assert_eq!(config.application_name, "Sound Manager");
        assert_eq!(config.dispatch_interval(), Duration::from_millis(5));
        assert!(config.call_timeout().is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config = SoundmanConfig::from_toml(
            r#"
            server = "unix:/run/user/1000/pulse/native"
            call_timeout_ms = 2000
            "#,
        )
        .unwrap();
        assert_eq!(config.server.as_deref(), Some("unix:/run/user/1000/pulse/native"));
        assert_eq!(config.call_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(config.application_name, "Sound Manager");
    }

    #[test]
    fn test_zero_dispatch_interval_is_raised() {
        let config = SoundmanConfig {
            dispatch_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.dispatch_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_manager_load_missing_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path().join("soundman")).unwrap();
        assert_eq!(manager.load().unwrap(), SoundmanConfig::default());

        let config = SoundmanConfig {
            application_name: "kiosk".to_string(),
            call_timeout_ms: Some(500),
            ..Default::default()
        };
        manager.save(&config).unwrap();
        assert_eq!(manager.load().unwrap(), config);
    }

    #[test]
    fn test_manager_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_dir(dir.path().to_path_buf()).unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "dispatch_interval_ms = \"soon\"").unwrap();
        assert!(matches!(manager.load(), Err(ConfigError::TomlParse(_))));
    }
}
