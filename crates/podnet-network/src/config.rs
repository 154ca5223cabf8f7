//! Podnet configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use podnet_common::paths::VENDOR_BIN_TEMPLATE;
use podnet_common::{PodnetError, PodnetPaths, PodnetResult};
use serde::{Deserialize, Serialize};

/// Configuration options for attachment and flow isolation.
///
/// Loaded from a TOML file; every key is optional and falls back to the
/// standard locations in [`PodnetPaths`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Directory scanned for network definitions.
    pub conf_dir: PathBuf,
    /// Directory holding the stock plugin binaries.
    pub bin_dir: PathBuf,
    /// Vendor plugin directory template, `{name}` is the network name.
    pub vendor_bin_template: String,
    /// Interface created inside the pod's network namespace.
    pub interface_name: String,
    /// Switch bridge that pod ports are attached to.
    pub bridge: String,
    /// Deadline for a single plugin invocation (seconds).
    pub plugin_timeout_secs: u64,
    /// Deadline for a switch operation (seconds).
    pub switch_timeout_secs: u64,
    /// State directory for port records.
    pub state_dir: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let paths = PodnetPaths::new();
        Self {
            conf_dir: paths.conf_dir,
            bin_dir: paths.bin_dir,
            vendor_bin_template: VENDOR_BIN_TEMPLATE.to_string(),
            interface_name: "eth0".to_string(),
            bridge: "br0".to_string(),
            plugin_timeout_secs: 30,
            switch_timeout_secs: 10,
            state_dir: paths.state,
        }
    }
}

impl NetworkConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid.
    pub fn load(path: impl AsRef<Path>) -> PodnetResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| PodnetError::Config {
            message: format!("{}: {e}", path.display()),
        })?;
        config.validate()?;

        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load configuration from `path` if it exists, defaults otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but is not valid.
    pub fn load_or_default(path: impl AsRef<Path>) -> PodnetResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No configuration file, using defaults");
            Ok(Self::default())
        }
    }

    fn validate(&self) -> PodnetResult<()> {
        if self.interface_name.is_empty() {
            return Err(PodnetError::Config {
                message: "interface_name must not be empty".to_string(),
            });
        }
        if self.bridge.is_empty() {
            return Err(PodnetError::Config {
                message: "bridge must not be empty".to_string(),
            });
        }
        if self.plugin_timeout_secs == 0 || self.switch_timeout_secs == 0 {
            return Err(PodnetError::Config {
                message: "timeouts must be at least one second".to_string(),
            });
        }
        Ok(())
    }

    /// Paths derived from this configuration.
    #[must_use]
    pub fn paths(&self) -> PodnetPaths {
        PodnetPaths {
            conf_dir: self.conf_dir.clone(),
            bin_dir: self.bin_dir.clone(),
            state: self.state_dir.clone(),
        }
    }

    /// Plugin invocation deadline.
    #[must_use]
    pub const fn plugin_timeout(&self) -> Duration {
        Duration::from_secs(self.plugin_timeout_secs)
    }

    /// Switch operation deadline.
    #[must_use]
    pub const fn switch_timeout(&self) -> Duration {
        Duration::from_secs(self.switch_timeout_secs)
    }

    /// Set the network definition directory.
    #[must_use]
    pub fn with_conf_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.conf_dir = dir.into();
        self
    }

    /// Set the stock plugin directory.
    #[must_use]
    pub fn with_bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = dir.into();
        self
    }

    /// Set the state directory.
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Set the switch bridge.
    #[must_use]
    pub fn with_bridge(mut self, bridge: impl Into<String>) -> Self {
        self.bridge = bridge.into();
        self
    }

    /// Set the plugin deadline.
    #[must_use]
    pub const fn with_plugin_timeout(mut self, secs: u64) -> Self {
        self.plugin_timeout_secs = secs;
        self
    }
}
