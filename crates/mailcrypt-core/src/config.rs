//! Persisted session settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use mailcrypt_pgp::{ToolConfig, ToolKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result};

/// User-facing settings of the crypto session, persisted as JSON.
///
/// Unknown fields in an existing file are ignored and missing fields
/// take their defaults, so the format can grow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keep the passphrase cached between operations instead of wiping
    /// it after each one.
    pub store_pass: bool,
    /// Which tool family to drive; `Auto` probes at selection time.
    pub tool: ToolKind,
    /// The user identity signing is performed as.
    pub user: String,
    /// Also encrypt outgoing messages to the user's own key.
    pub encrypt_to_self: bool,
    /// Explicit tool binary path, overriding the `$PATH` probe.
    pub binary_override: Option<PathBuf>,
    /// Hard limit on one tool invocation, in seconds.
    pub tool_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store_pass: false,
            tool: ToolKind::Auto,
            user: String::new(),
            encrypt_to_self: false,
            binary_override: None,
            tool_timeout_secs: 60,
        }
    }
}

impl SessionConfig {
    /// The per-user config file location.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoConfigDir`] when the platform exposes no
    /// configuration directory.
    pub fn config_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("mailcrypt").join("config.json"))
            .ok_or(Error::NoConfigDir)
    }

    /// Loads the configuration from the default location.
    ///
    /// A missing file yields defaults; a malformed file is logged and
    /// also yields defaults, so a bad edit never locks the user out.
    #[must_use]
    pub fn load() -> Self {
        match Self::config_path() {
            Ok(path) => Self::load_from(&path),
            Err(e) => {
                warn!(error = %e, "using default configuration");
                Self::default()
            }
        }
    }

    /// Loads the configuration from an explicit path.
    #[must_use]
    pub fn load_from(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Self::default();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read config, using defaults");
                return Self::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(config) => {
                debug!(path = %path.display(), "configuration loaded");
                config
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "malformed config, using defaults");
                Self::default()
            }
        }
    }

    /// Persists the configuration to the default location.
    ///
    /// # Errors
    ///
    /// Fails when the location is unavailable or the write fails.
    pub fn store(&self) -> Result<()> {
        self.store_to(&Self::config_path()?)
    }

    /// Persists the configuration to an explicit path, creating parent
    /// directories as needed.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be created or the file cannot be
    /// written.
    pub fn store_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| Error::ConfigIo {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let raw = serde_json::to_string_pretty(self).map_err(|source| Error::ConfigFormat {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, raw).map_err(|source| Error::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "configuration stored");
        Ok(())
    }

    /// The subset of settings the tool adapters need.
    #[must_use]
    pub fn tool_config(&self) -> ToolConfig {
        ToolConfig {
            user: self.user.clone(),
            encrypt_to_self: self.encrypt_to_self,
            binary_override: self.binary_override.clone(),
            timeout: Duration::from_secs(self.tool_timeout_secs),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::load_from(&dir.path().join("nope.json"));
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.tool_timeout_secs, 60);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep").join("config.json");
        let config = SessionConfig {
            store_pass: true,
            tool: ToolKind::Gpg,
            user: "alice@example.com".to_string(),
            encrypt_to_self: true,
            binary_override: Some(PathBuf::from("/opt/gnupg/bin/gpg")),
            tool_timeout_secs: 15,
        };
        config.store_to(&path).unwrap();
        assert_eq!(SessionConfig::load_from(&path), config);
    }

    #[test]
    fn malformed_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(SessionConfig::load_from(&path), SessionConfig::default());
    }

    #[test]
    fn tool_config_carries_the_timeout() {
        let config = SessionConfig {
            tool_timeout_secs: 5,
            ..SessionConfig::default()
        };
        assert_eq!(config.tool_config().timeout, Duration::from_secs(5));
    }
}
