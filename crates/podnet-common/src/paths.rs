//! Standard filesystem paths for podnet.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Directory scanned for network definitions.
pub static PODNET_CONF_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("PODNET_CONF_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/cni/net.d"))
});

/// Directory holding the stock plugin binaries.
pub static PODNET_BIN_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("PODNET_BIN_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/opt/cni/bin"))
});

/// Root directory for podnet state.
pub static PODNET_STATE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("PODNET_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/podnet"))
});

/// Template for vendor plugin directories; `{name}` is the network name.
pub const VENDOR_BIN_TEMPLATE: &str = "/opt/{name}/bin";

/// Standard paths used by podnet.
#[derive(Debug, Clone)]
pub struct PodnetPaths {
    /// Network definition directory (default: /etc/cni/net.d).
    pub conf_dir: PathBuf,
    /// Stock plugin directory (default: /opt/cni/bin).
    pub bin_dir: PathBuf,
    /// State directory (default: /var/lib/podnet).
    pub state: PathBuf,
}

impl PodnetPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom state directory.
    #[must_use]
    pub fn with_state(state: impl Into<PathBuf>) -> Self {
        Self {
            state: state.into(),
            ..Self::default()
        }
    }

    /// Default config file location.
    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.state.join("podnet.toml")
    }

    /// Directory of persisted pod → switch port records.
    #[must_use]
    pub fn ports(&self) -> PathBuf {
        self.state.join("ports")
    }

    /// Directory of per-sandbox attachment ledgers.
    #[must_use]
    pub fn attachments(&self) -> PathBuf {
        self.state.join("attachments")
    }

    /// Directory of pod manifests used by the standalone host.
    #[must_use]
    pub fn pods(&self) -> PathBuf {
        self.state.join("pods")
    }
}

/// Expand the vendor plugin directory for a network.
#[must_use]
pub fn vendor_bin_dir(template: &str, network: &str) -> PathBuf {
    PathBuf::from(template.replace("{name}", network))
}

impl Default for PodnetPaths {
    fn default() -> Self {
        Self {
            conf_dir: PODNET_CONF_DIR.clone(),
            bin_dir: PODNET_BIN_DIR.clone(),
            state: PODNET_STATE_DIR.clone(),
        }
    }
}
