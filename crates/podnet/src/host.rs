//! Directory-backed runtime host.
//!
//! Pods are described by JSON manifests under `<state>/pods`, one file per
//! pod named `<namespace>_<name>.json`. Sandbox network namespaces are the
//! bind mounts `ip netns` creates under `/var/run/netns`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use podnet_common::{PodnetError, PodnetPaths, PodnetResult, SandboxId};
use podnet_network::{PodIdentity, RuntimeHost};
use serde::Deserialize;

/// Where `ip netns` keeps named network namespaces.
pub const NETNS_DIR: &str = "/var/run/netns";

/// Manifest field carrying the pod's host-side interface.
const HOST_VETH_FIELD: &str = "hostVeth";

/// On-disk pod manifest.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodManifest {
    #[serde(flatten)]
    pod: PodIdentity,
    #[serde(default)]
    host_veth: Option<String>,
}

/// Reads pods and sandboxes from the local filesystem.
#[derive(Debug, Clone)]
pub struct DirectoryHost {
    pods_dir: PathBuf,
    netns_dir: PathBuf,
}

impl DirectoryHost {
    /// Create a host over explicit directories.
    pub fn new(pods_dir: impl Into<PathBuf>, netns_dir: impl Into<PathBuf>) -> Self {
        Self {
            pods_dir: pods_dir.into(),
            netns_dir: netns_dir.into(),
        }
    }

    /// Create a host over the standard layout.
    #[must_use]
    pub fn from_paths(paths: &PodnetPaths) -> Self {
        Self::new(paths.pods(), NETNS_DIR)
    }

    fn manifest_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.pods_dir.join(format!("{namespace}_{name}.json"))
    }

    async fn read_manifest(&self, namespace: &str, name: &str) -> PodnetResult<serde_json::Value> {
        let path = self.manifest_path(namespace, name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PodnetError::PodNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn manifests(&self) -> PodnetResult<Vec<(PathBuf, PodManifest)>> {
        let mut entries = match tokio::fs::read_dir(&self.pods_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut manifests = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<PodManifest>(&bytes) {
                Ok(manifest) => manifests.push((path, manifest)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable pod manifest");
                }
            }
        }
        Ok(manifests)
    }
}

#[async_trait]
impl RuntimeHost for DirectoryHost {
    async fn get_net_ns(&self, sandbox_id: &SandboxId) -> PodnetResult<PathBuf> {
        let path = self.netns_dir.join(sandbox_id.as_str());
        if tokio::fs::try_exists(&path).await? {
            Ok(path)
        } else {
            Err(PodnetError::SandboxNotFound {
                id: sandbox_id.to_string(),
            })
        }
    }

    async fn get_pod_by_name(&self, namespace: &str, name: &str) -> PodnetResult<PodIdentity> {
        let value = self.read_manifest(namespace, name).await?;
        let manifest = PodManifest::deserialize(value)?;
        Ok(manifest.pod)
    }

    async fn update_pod_ip(&self, namespace: &str, name: &str, ip: &str) -> PodnetResult<()> {
        let mut value = self.read_manifest(namespace, name).await?;
        let Some(object) = value.as_object_mut() else {
            return Err(PodnetError::Serialization(format!(
                "pod manifest for {namespace}/{name} is not an object"
            )));
        };
        object.insert("podIp".to_string(), serde_json::Value::from(ip));

        let path = self.manifest_path(namespace, name);
        write_atomic(&path, &serde_json::to_vec_pretty(&value)?).await?;

        tracing::debug!(namespace, pod = name, ip, "Updated pod IP");
        Ok(())
    }

    async fn find_ports_by_pod_marker(&self, namespace: &str, pod_name: &str) -> PodnetResult<Vec<String>> {
        let ports = self
            .manifests()
            .await?
            .into_iter()
            .filter(|(_, manifest)| manifest.pod.namespace == namespace && manifest.pod.name == pod_name)
            .filter_map(|(path, manifest)| {
                if manifest.host_veth.is_none() {
                    tracing::debug!(path = %path.display(), field = HOST_VETH_FIELD, "Pod manifest has no host interface");
                }
                manifest.host_veth
            })
            .collect();
        Ok(ports)
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> PodnetResult<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
