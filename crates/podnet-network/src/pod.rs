//! Pod identity and the container runtime boundary.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use podnet_common::{PodnetResult, SandboxId};
use serde::{Deserialize, Serialize};

/// A pod as seen by the network layer.
///
/// Supplied by the node agent's pod object model; podnet never mutates it
/// except through [`RuntimeHost::update_pod_ip`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodIdentity {
    /// Pod namespace.
    pub namespace: String,
    /// Pod name.
    pub name: String,
    /// Sandbox (infra container) ID.
    pub sandbox_id: SandboxId,
    /// Pod labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Pod annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Recorded primary IP, as stored by the pod object model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
}

impl PodIdentity {
    /// Create a pod with no labels, annotations or address.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, sandbox_id: SandboxId) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            sandbox_id,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            pod_ip: None,
        }
    }

    /// Add a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add an annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Key identifying this pod incarnation.
    #[must_use]
    pub fn key(&self) -> PodKey {
        PodKey::new(&self.namespace, &self.name, self.sandbox_id.clone())
    }
}

/// Identifies one sandbox of one pod.
///
/// A recreated sandbox gets a new key, so attachments recorded for the old
/// sandbox are never reused for the new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodKey {
    /// Pod namespace.
    pub namespace: String,
    /// Pod name.
    pub name: String,
    /// Sandbox ID.
    pub sandbox_id: SandboxId,
}

impl PodKey {
    /// Create a pod key.
    pub fn new(namespace: &str, name: &str, sandbox_id: SandboxId) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            sandbox_id,
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.namespace, self.name, self.sandbox_id.short())
    }
}

/// Container runtime and pod object model, as needed by podnet.
#[async_trait]
pub trait RuntimeHost: Send + Sync {
    /// Network namespace handle of a sandbox.
    ///
    /// Fails with `SandboxNotFound`.
    async fn get_net_ns(&self, sandbox_id: &SandboxId) -> PodnetResult<PathBuf>;

    /// Look up a pod by namespace and name.
    ///
    /// Fails with `PodNotFound`.
    async fn get_pod_by_name(&self, namespace: &str, name: &str) -> PodnetResult<PodIdentity>;

    /// Overwrite the pod's visible primary IP.
    async fn update_pod_ip(&self, namespace: &str, name: &str, ip: &str) -> PodnetResult<()>;

    /// Host-side switch ports of containers whose hostname marker equals
    /// `pod_name`, limited to pods of `namespace`. Zero or more matches.
    async fn find_ports_by_pod_marker(&self, namespace: &str, pod_name: &str) -> PodnetResult<Vec<String>>;
}
