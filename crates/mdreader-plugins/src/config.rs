//! Loader configuration.
//!
//! Loaded from JSON5. Default location: `~/.mdreader/plugins.json`, or
//! `$MDREADER_STATE_DIR/plugins.json` when that variable is set.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::BridgeConfig;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON5 parsing error.
    #[error("Parse error: {0}")]
    Parse(#[from] json5::Error),

    /// Config validation error.
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Which channel native plugins are launched over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    /// Spawn the plugin executable.
    #[default]
    Process,
    /// Answer from the built-in canned table.
    Simulated,
    /// Spawn if the executable resolves, otherwise simulate.
    Auto,
}

/// Plugin loader configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderConfig {
    /// Directory scanned for plugin manifests.
    #[serde(default = "default_plugins_dir")]
    pub plugins_dir: PathBuf,

    /// Include the manifests shipped with the host.
    #[serde(default = "default_true")]
    pub builtin_plugins: bool,

    /// Handshake window in milliseconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Default request timeout in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Grace period before a stopping plugin is killed, in milliseconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Maximum in-flight requests per plugin.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    /// Channel selection.
    #[serde(default)]
    pub channel: ChannelMode,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            plugins_dir: default_plugins_dir(),
            builtin_plugins: true,
            handshake_timeout_ms: default_handshake_timeout(),
            request_timeout_ms: default_request_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
            max_pending: default_max_pending(),
            channel: ChannelMode::default(),
        }
    }
}

impl LoaderConfig {
    /// Load configuration from the default location, or defaults if absent.
    ///
    /// # Errors
    ///
    /// Returns error if an existing file cannot be loaded or parsed.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded plugin loader config");
        Ok(config)
    }

    /// Save configuration to a path.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or file write fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config file path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        Self::state_dir().join("plugins.json")
    }

    /// Get the MD Reader Pro state directory.
    ///
    /// Uses `MDREADER_STATE_DIR` env var if set, otherwise `~/.mdreader`.
    #[must_use]
    pub fn state_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("MDREADER_STATE_DIR") {
            PathBuf::from(dir)
        } else if let Some(home) = dirs::home_dir() {
            home.join(".mdreader")
        } else {
            PathBuf::from(".mdreader")
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if a timeout or the pending limit is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("handshakeTimeoutMs", self.handshake_timeout_ms),
            ("requestTimeoutMs", self.request_timeout_ms),
            ("shutdownGraceMs", self.shutdown_grace_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{name} cannot be 0")));
            }
        }

        if self.max_pending == 0 {
            return Err(ConfigError::Validation(
                "maxPending cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Bridge settings derived from this config.
    #[must_use]
    pub const fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            max_pending: self.max_pending,
        }
    }
}

fn default_plugins_dir() -> PathBuf {
    LoaderConfig::state_dir().join("plugins")
}

const fn default_true() -> bool {
    true
}

const fn default_handshake_timeout() -> u64 {
    5_000
}

const fn default_request_timeout() -> u64 {
    30_000
}

const fn default_shutdown_grace() -> u64 {
    1_000
}

const fn default_max_pending() -> usize {
    1_024
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = LoaderConfig::default();
        assert_eq!(config.handshake_timeout_ms, 5_000);
        assert_eq!(config.request_timeout_ms, 30_000);
        assert_eq!(config.shutdown_grace_ms, 1_000);
        assert_eq!(config.channel, ChannelMode::Process);
        assert!(config.validate().is_ok());

        let bridge = config.bridge_config();
        assert_eq!(bridge.handshake_timeout, Duration::from_secs(5));
        assert_eq!(bridge.max_pending, 1_024);
    }

    #[test]
    fn test_load_partial_json5() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        std::fs::write(
            &path,
            r#"{
                // only override what matters
                requestTimeoutMs: 1500,
                channel: "simulated",
            }"#,
        )
        .unwrap();

        let config = LoaderConfig::load(&path).unwrap();
        assert_eq!(config.request_timeout_ms, 1_500);
        assert_eq!(config.channel, ChannelMode::Simulated);
        assert_eq!(config.handshake_timeout_ms, 5_000);
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        std::fs::write(&path, r#"{ handshakeTimeoutMs: 0 }"#).unwrap();

        assert!(matches!(
            LoaderConfig::load(&path),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("plugins.json");

        let config = LoaderConfig {
            channel: ChannelMode::Auto,
            max_pending: 8,
            ..LoaderConfig::default()
        };
        config.save(&path).unwrap();

        assert_eq!(LoaderConfig::load(&path).unwrap(), config);
    }
}
