//! Network selection for pods.
//!
//! A pod is attached to every network it asks for:
//!
//! 1. the network named like the pod's namespace,
//! 2. the networks listed in the [`NETWORKS_KEY`] label,
//! 3. the networks listed in the [`NETWORKS_KEY`] annotation.
//!
//! Unknown names are ignored and duplicates keep their first position. A pod
//! that asks for nothing known lands on the catalog default.

use std::collections::HashSet;
use std::sync::Arc;

use podnet_common::{PodnetError, PodnetResult};

use crate::catalog::{CatalogSnapshot, NetworkCatalog, NetworkDefinition};
use crate::pod::PodIdentity;

/// Label and annotation key holding a JSON array of network names.
pub const NETWORKS_KEY: &str = "net.experimental.kubernetes.io/networks";

/// Where a network request was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestSource {
    /// A pod label.
    Label,
    /// A pod annotation.
    Annotation,
}

impl std::fmt::Display for RequestSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Label => write!(f, "label"),
            Self::Annotation => write!(f, "annotation"),
        }
    }
}

/// A pod's explicit request for networks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkRequest {
    /// The key is not set.
    Absent,
    /// A (possibly empty) list of network names.
    Names(Vec<String>),
    /// The value is not a JSON array of strings.
    Malformed {
        /// Parse failure.
        reason: String,
    },
}

impl NetworkRequest {
    /// Parse a label or annotation value.
    #[must_use]
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            None => Self::Absent,
            Some(raw) => match serde_json::from_str::<Vec<String>>(raw) {
                Ok(names) => Self::Names(names),
                Err(e) => Self::Malformed {
                    reason: e.to_string(),
                },
            },
        }
    }

    /// Read the request from a pod.
    #[must_use]
    pub fn from_pod(pod: &PodIdentity, source: RequestSource) -> Self {
        let map = match source {
            RequestSource::Label => &pod.labels,
            RequestSource::Annotation => &pod.annotations,
        };
        Self::parse(map.get(NETWORKS_KEY).map(String::as_str))
    }

    /// Requested names; empty unless well-formed.
    #[must_use]
    pub fn names(&self) -> &[String] {
        match self {
            Self::Names(names) => names,
            Self::Absent | Self::Malformed { .. } => &[],
        }
    }
}

/// The ordered networks one pod is attached to. Never empty.
#[derive(Debug, Clone)]
pub struct PodNetworkSelection(Vec<Arc<NetworkDefinition>>);

impl PodNetworkSelection {
    /// Networks in attach order.
    #[must_use]
    pub fn networks(&self) -> &[Arc<NetworkDefinition>] {
        &self.0
    }

    /// Network names in attach order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|d| d.name.as_str()).collect()
    }

    /// Networks in detach order.
    pub fn detach_order(&self) -> impl Iterator<Item = &Arc<NetworkDefinition>> {
        self.0.iter().rev()
    }

    /// Number of selected networks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept for API symmetry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Select the networks for `pod` from `snapshot`.
///
/// # Errors
///
/// Returns [`PodnetError::NoNetworksAvailable`] when the snapshot is empty.
pub fn select(pod: &PodIdentity, snapshot: &CatalogSnapshot) -> PodnetResult<PodNetworkSelection> {
    let Some(default) = snapshot.default_network() else {
        return Err(PodnetError::NoNetworksAvailable {
            dir: snapshot.dir().display().to_string(),
        });
    };

    let mut seen = HashSet::new();
    let mut selected = Vec::new();
    let mut push = |definition: Arc<NetworkDefinition>| {
        if seen.insert(definition.name.clone()) {
            selected.push(definition);
        }
    };

    if let Some(definition) = snapshot.lookup(&pod.namespace) {
        push(definition);
    }

    for source in [RequestSource::Label, RequestSource::Annotation] {
        let request = NetworkRequest::from_pod(pod, source);
        if let NetworkRequest::Malformed { reason } = &request {
            tracing::warn!(
                namespace = %pod.namespace,
                pod = %pod.name,
                %source,
                key = NETWORKS_KEY,
                reason,
                "Ignoring malformed network list"
            );
        }
        for name in request.names() {
            match snapshot.lookup(name) {
                Some(definition) => push(definition),
                None => tracing::debug!(pod = %pod.name, network = %name, %source, "Requested network unknown"),
            }
        }
    }

    if selected.is_empty() {
        selected.push(default);
    }

    tracing::debug!(
        namespace = %pod.namespace,
        pod = %pod.name,
        networks = ?selected.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
        "Selected networks"
    );
    Ok(PodNetworkSelection(selected))
}

/// Selects networks against a freshly scanned catalog.
#[derive(Debug, Clone)]
pub struct NetworkSelector {
    catalog: Arc<NetworkCatalog>,
}

impl NetworkSelector {
    /// Create a selector over `catalog`.
    #[must_use]
    pub const fn new(catalog: Arc<NetworkCatalog>) -> Self {
        Self { catalog }
    }

    /// Refresh the catalog, then select networks for `pod`.
    ///
    /// Networks may be created between calls, so every selection pays for a
    /// directory scan.
    ///
    /// # Errors
    ///
    /// Returns [`PodnetError::NoNetworksAvailable`] when no network is defined.
    pub async fn select_for(&self, pod: &PodIdentity) -> PodnetResult<PodNetworkSelection> {
        let snapshot = self.catalog.refresh().await;
        select(pod, &snapshot)
    }
}
