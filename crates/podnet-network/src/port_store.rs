//! Pod → switch port persistence.
//!
//! When a pod's port is wired to the switch, its flow rule set is written
//! here so teardown can find the port and rules again from the pod's name
//! alone.

use std::path::{Path, PathBuf};

use podnet_common::PodnetResult;
use serde::{Deserialize, Serialize};

use crate::flow::FlowRuleSet;

/// What is known about one pod's switch wiring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    /// Pod namespace.
    pub namespace: String,
    /// Pod name.
    pub name: String,
    /// Installed rules, including the port.
    pub flows: FlowRuleSet,
}

/// Manages port record persistence.
#[derive(Debug, Clone)]
pub struct PortStore {
    /// Directory of record files.
    dir: PathBuf,
}

impl PortStore {
    /// Create a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a pod's record file.
    #[must_use]
    pub fn record_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.dir.join(format!("{namespace}_{name}.json"))
    }

    /// Save a record, replacing any previous one for the pod.
    pub async fn save(&self, record: &PortRecord) -> PodnetResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.record_path(&record.namespace, &record.name);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(
            namespace = %record.namespace,
            pod = %record.name,
            port = %record.flows.port.name,
            path = %path.display(),
            "Saved port record"
        );

        Ok(())
    }

    /// Load a pod's record, if any.
    pub async fn load(&self, namespace: &str, name: &str) -> PodnetResult<Option<PortRecord>> {
        let path = self.record_path(namespace, name);

        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: PortRecord = serde_json::from_str(&json)?;

        tracing::debug!(namespace, pod = name, path = %path.display(), "Loaded port record");
        Ok(Some(record))
    }

    /// Delete a pod's record. Missing records are fine.
    pub async fn delete(&self, namespace: &str, name: &str) -> PodnetResult<()> {
        let path = self.record_path(namespace, name);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(namespace, pod = name, path = %path.display(), "Deleted port record");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All stored records, ordered by namespace and name.
    pub async fn list(&self) -> PodnetResult<Vec<PortRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records: Vec<PortRecord> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let json = tokio::fs::read_to_string(&path).await?;
                match serde_json::from_str(&json) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping corrupt port record");
                    }
                }
            }
        }
        records.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(records)
    }
}
