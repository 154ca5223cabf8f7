//! Network definition catalog.
//!
//! Network definitions are discovered from a configuration directory, one
//! network per `*.conf` / `*.json` file. Files are processed in path order;
//! the first one that parses becomes the default network.
//!
//! A refresh builds a complete [`CatalogSnapshot`] off to the side and then
//! swaps it in. Readers hold an `Arc` to whichever snapshot was current when
//! they asked, so they never see a half-built map.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use podnet_common::paths::vendor_bin_dir;
use podnet_common::{PodnetError, PodnetResult};
use serde::Deserialize;

use crate::config::NetworkConfig;

/// File extensions recognised as network definitions.
const DEFINITION_EXTENSIONS: &[&str] = &["conf", "json"];

/// A named virtual network and the plugin that realizes it.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkDefinition {
    /// Network name, unique within a snapshot.
    pub name: String,
    /// Plugin binary name (the config's `type`).
    pub plugin_type: String,
    /// Directories searched for the plugin binary, in order.
    pub plugin_search_paths: Vec<PathBuf>,
    /// The full network configuration handed to the plugin.
    pub raw_config: serde_json::Value,
    /// File the definition was loaded from.
    pub source: PathBuf,
}

#[derive(Deserialize)]
struct DefinitionHeader {
    name: String,
    #[serde(rename = "type")]
    plugin_type: String,
}

impl NetworkDefinition {
    /// Parse a definition from the contents of `source`.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is not a JSON object with non-empty
    /// `name` and `type` fields.
    pub fn parse(
        source: impl Into<PathBuf>,
        content: &[u8],
        bin_dir: &Path,
        vendor_bin_template: &str,
    ) -> PodnetResult<Self> {
        let source = source.into();
        let raw_config: serde_json::Value = serde_json::from_slice(content)?;
        let header = DefinitionHeader::deserialize(&raw_config)?;

        if header.name.is_empty() || header.plugin_type.is_empty() {
            return Err(PodnetError::Config {
                message: format!("{}: network name and type are required", source.display()),
            });
        }

        let plugin_search_paths = vec![
            bin_dir.to_path_buf(),
            vendor_bin_dir(vendor_bin_template, &header.name),
        ];

        Ok(Self {
            name: header.name,
            plugin_type: header.plugin_type,
            plugin_search_paths,
            raw_config,
            source,
        })
    }
}

/// Immutable view of the known networks.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    dir: PathBuf,
    by_name: HashMap<String, Arc<NetworkDefinition>>,
    ordered: Vec<Arc<NetworkDefinition>>,
}

impl CatalogSnapshot {
    /// Build a snapshot from definitions given in priority order.
    ///
    /// The first definition becomes the default. A later definition reusing
    /// an earlier name is dropped.
    pub fn from_definitions(
        dir: impl Into<PathBuf>,
        definitions: impl IntoIterator<Item = NetworkDefinition>,
    ) -> Self {
        let mut snapshot = Self {
            dir: dir.into(),
            ..Self::default()
        };

        for definition in definitions {
            if let Some(existing) = snapshot.by_name.get(&definition.name) {
                tracing::warn!(
                    network = %definition.name,
                    kept = %existing.source.display(),
                    skipped = %definition.source.display(),
                    "Duplicate network name, keeping first definition"
                );
                continue;
            }
            let definition = Arc::new(definition);
            snapshot
                .by_name
                .insert(definition.name.clone(), Arc::clone(&definition));
            snapshot.ordered.push(definition);
        }

        snapshot
    }

    /// Directory this snapshot was discovered from.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Look up a network by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<NetworkDefinition>> {
        self.by_name.get(name).cloned()
    }

    /// The default network, if any.
    #[must_use]
    pub fn default_network(&self) -> Option<Arc<NetworkDefinition>> {
        self.ordered.first().cloned()
    }

    /// All networks in discovery order.
    pub fn networks(&self) -> impl Iterator<Item = &Arc<NetworkDefinition>> {
        self.ordered.iter()
    }

    /// Number of networks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Whether no network is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Handle on the node's network definitions.
#[derive(Debug)]
pub struct NetworkCatalog {
    conf_dir: PathBuf,
    bin_dir: PathBuf,
    vendor_bin_template: String,
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl NetworkCatalog {
    /// Create a catalog over the configured directory.
    ///
    /// The catalog starts empty; call [`NetworkCatalog::refresh`] to scan.
    #[must_use]
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            conf_dir: config.conf_dir.clone(),
            bin_dir: config.bin_dir.clone(),
            vendor_bin_template: config.vendor_bin_template.clone(),
            current: RwLock::new(Arc::new(CatalogSnapshot {
                dir: config.conf_dir.clone(),
                ..CatalogSnapshot::default()
            })),
        }
    }

    /// Directory scanned for definitions.
    #[must_use]
    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    /// Rescan the configuration directory and publish the result.
    ///
    /// Files that cannot be read or parsed are skipped with a warning. A
    /// missing directory yields an empty snapshot.
    pub async fn refresh(&self) -> Arc<CatalogSnapshot> {
        let files = match definition_files(&self.conf_dir).await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(dir = %self.conf_dir.display(), error = %e, "Cannot list network definitions");
                Vec::new()
            }
        };

        let mut definitions = Vec::with_capacity(files.len());
        for path in files {
            match self.load_definition(&path).await {
                Ok(definition) => definitions.push(definition),
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Error loading network definition, skipping");
                }
            }
        }

        let snapshot = Arc::new(CatalogSnapshot::from_definitions(
            &self.conf_dir,
            definitions,
        ));
        tracing::debug!(
            dir = %self.conf_dir.display(),
            networks = snapshot.len(),
            default = ?snapshot.default_network().map(|d| d.name.clone()),
            "Network catalog refreshed"
        );

        *self.current.write() = Arc::clone(&snapshot);
        snapshot
    }

    async fn load_definition(&self, path: &Path) -> PodnetResult<NetworkDefinition> {
        let content = tokio::fs::read(path).await?;
        NetworkDefinition::parse(path, &content, &self.bin_dir, &self.vendor_bin_template)
    }

    /// Current snapshot, without rescanning.
    #[must_use]
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Look up a network in the current snapshot.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<NetworkDefinition>> {
        self.snapshot().lookup(name)
    }
}

/// Definition files in `dir`, sorted by path.
async fn definition_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        let recognised = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| DEFINITION_EXTENSIONS.contains(&ext));
        if recognised {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}
