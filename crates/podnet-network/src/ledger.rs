//! Persistent record of which networks each pod sandbox is attached to.
//!
//! One JSON file per pod sandbox under the ledger directory, mirrored in an
//! in-memory cache. A restarted agent reads the file back on first use, so
//! a retried set-up still skips networks attached before the restart.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use podnet_common::PodnetResult;
use serde::{Deserialize, Serialize};

use crate::plugin::AttachmentResult;
use crate::pod::PodKey;

/// On-disk form of one pod sandbox's attachments.
#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    pod: PodKey,
    attachments: Vec<AttachmentResult>,
}

/// Attachments per pod sandbox, in attach order.
#[derive(Debug)]
pub struct AttachmentLedger {
    dir: PathBuf,
    cache: DashMap<PodKey, Vec<AttachmentResult>>,
}

impl AttachmentLedger {
    /// Open a ledger rooted at `dir`. Nothing is read until a key is used.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: DashMap::new(),
        }
    }

    /// Ledger directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &PodKey) -> PathBuf {
        self.dir
            .join(format!("{}_{}_{}.json", key.namespace, key.name, key.sandbox_id))
    }

    /// Attachments recorded for `key`.
    pub async fn attachments(&self, key: &PodKey) -> PodnetResult<Vec<AttachmentResult>> {
        if let Some(entry) = self.cache.get(key) {
            return Ok(entry.value().clone());
        }

        let path = self.entry_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file: LedgerFile = serde_json::from_slice(&bytes)?;
        tracing::debug!(pod = %key, count = file.attachments.len(), path = %path.display(), "Loaded attachment ledger");

        self.cache.insert(key.clone(), file.attachments.clone());
        Ok(file.attachments)
    }

    /// The recorded attachment of `key` to `network`, if any.
    pub async fn recorded(&self, key: &PodKey, network: &str) -> PodnetResult<Option<AttachmentResult>> {
        Ok(self
            .attachments(key)
            .await?
            .into_iter()
            .find(|result| result.network == network))
    }

    /// Record a successful attach, replacing an earlier one to the same network.
    pub async fn record(&self, key: &PodKey, result: AttachmentResult) -> PodnetResult<()> {
        let mut attachments = self.attachments(key).await?;
        attachments.retain(|existing| existing.network != result.network);
        attachments.push(result);
        self.store(key, attachments).await
    }

    /// Drop the record of `network`. The entry goes away with its last network.
    pub async fn forget(&self, key: &PodKey, network: &str) -> PodnetResult<()> {
        let mut attachments = self.attachments(key).await?;
        let before = attachments.len();
        attachments.retain(|existing| existing.network != network);
        if attachments.len() == before {
            return Ok(());
        }
        self.store(key, attachments).await
    }

    async fn store(&self, key: &PodKey, attachments: Vec<AttachmentResult>) -> PodnetResult<()> {
        let path = self.entry_path(key);

        if attachments.is_empty() {
            self.cache.remove(key);
            return match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::debug!(pod = %key, "Cleared attachment ledger");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let file = LedgerFile {
            pod: key.clone(),
            attachments,
        };
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&file)?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        self.cache.insert(key.clone(), file.attachments);
        Ok(())
    }
}
