//! Pod network attachment lifecycle.
//!
//! [`AttachmentOrchestrator`] is what the node agent calls when a pod
//! sandbox comes and goes. It selects the pod's networks, runs the plugin of
//! each, and keeps the pod's visible address current.
//!
//! Set-up stops at the first failing network and leaves earlier networks
//! attached. Each success is recorded in a persistent ledger keyed by pod
//! sandbox, so a retried set-up skips what already worked and resumes at
//! the failed network, across agent restarts too. Teardown always visits every network and reports each outcome.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use podnet_common::{PodnetError, PodnetResult, SandboxId};

use crate::catalog::{NetworkCatalog, NetworkDefinition};
use crate::ledger::AttachmentLedger;
use crate::plugin::{AttachmentResult, PluginInvoker};
use crate::pod::{PodIdentity, PodKey, RuntimeHost};
use crate::selector::{NetworkSelector, PodNetworkSelection};

/// What happened to one network during set-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The plugin attached the pod.
    Attached(AttachmentResult),
    /// An earlier set-up already attached the pod; the plugin was not called.
    AlreadyAttached(AttachmentResult),
}

impl AttachOutcome {
    /// The attachment, fresh or recorded.
    #[must_use]
    pub const fn result(&self) -> &AttachmentResult {
        match self {
            Self::Attached(result) | Self::AlreadyAttached(result) => result,
        }
    }
}

/// Result of a successful set-up.
#[derive(Debug, Clone)]
pub struct AttachmentReport {
    /// The pod sandbox.
    pub pod: PodKey,
    /// One outcome per selected network, in attach order.
    pub outcomes: Vec<AttachOutcome>,
    /// The pod's visible primary address after set-up.
    pub primary_ip: Option<IpAddr>,
}

/// What happened to one network during teardown.
#[derive(Debug)]
pub enum DetachOutcome {
    /// The plugin detached the pod.
    Detached,
    /// The plugin failed.
    Failed(PodnetError),
}

/// Result of a teardown.
#[derive(Debug)]
pub struct TeardownReport {
    /// The pod sandbox.
    pub pod: PodKey,
    /// `(network, outcome)` per selected network, in detach order.
    pub outcomes: Vec<(String, DetachOutcome)>,
}

impl TeardownReport {
    /// Whether every network was detached.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, outcome)| matches!(outcome, DetachOutcome::Detached))
    }

    /// Networks whose detach failed, for a targeted retry.
    #[must_use]
    pub fn failed_networks(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, DetachOutcome::Failed(_)))
            .map(|(network, _)| network.as_str())
            .collect()
    }

    /// Collapse into the first failure, if any.
    ///
    /// # Errors
    ///
    /// Returns the error of the first network that failed to detach.
    pub fn into_result(self) -> PodnetResult<()> {
        self.outcomes
            .into_iter()
            .find_map(|(_, outcome)| match outcome {
                DetachOutcome::Failed(e) => Some(e),
                DetachOutcome::Detached => None,
            })
            .map_or(Ok(()), Err)
    }
}

/// Drives set-up, teardown and status of pod networking.
pub struct AttachmentOrchestrator {
    host: Arc<dyn RuntimeHost>,
    invoker: Arc<dyn PluginInvoker>,
    selector: NetworkSelector,
    ledger: AttachmentLedger,
    plugin_timeout: Duration,
}

impl AttachmentOrchestrator {
    /// Create an orchestrator.
    pub fn new(
        host: Arc<dyn RuntimeHost>,
        invoker: Arc<dyn PluginInvoker>,
        catalog: Arc<NetworkCatalog>,
        ledger: AttachmentLedger,
        plugin_timeout: Duration,
    ) -> Self {
        Self {
            host,
            invoker,
            selector: NetworkSelector::new(catalog),
            ledger,
            plugin_timeout,
        }
    }

    /// Attach a pod sandbox to all of its networks.
    ///
    /// # Errors
    ///
    /// Returns `SandboxNotFound`, `PodNotFound` or `NoNetworksAvailable`
    /// before any plugin runs, and `PluginFailure` / `DeadlineExceeded` for
    /// the first network that fails. Networks attached before the failure
    /// stay attached and are skipped on retry.
    pub async fn set_up_pod(
        &self,
        namespace: &str,
        name: &str,
        sandbox_id: &SandboxId,
    ) -> PodnetResult<AttachmentReport> {
        let (pod, netns, selection) = self.resolve(namespace, name, sandbox_id).await?;
        let key = pod.key();

        tracing::info!(pod = %key, networks = ?selection.names(), "Setting up pod networking");

        let mut report = AttachmentReport {
            pod: key.clone(),
            outcomes: Vec::with_capacity(selection.len()),
            primary_ip: None,
        };

        for network in selection.networks() {
            let outcome = match self.ledger.recorded(&key, &network.name).await? {
                Some(result) => {
                    tracing::debug!(pod = %key, network = %network.name, "Already attached, skipping plugin");
                    AttachOutcome::AlreadyAttached(result)
                }
                None => {
                    let result = self.attach(network, &pod, &netns).await?;
                    self.ledger.record(&key, result.clone()).await?;
                    AttachOutcome::Attached(result)
                }
            };

            // Single status slot: the last network with an address wins.
            if let Some(ip) = outcome.result().primary_ip() {
                self.host
                    .update_pod_ip(namespace, name, &ip.to_string())
                    .await?;
                report.primary_ip = Some(ip);
            }
            report.outcomes.push(outcome);
        }

        tracing::info!(pod = %key, ip = ?report.primary_ip, "Pod networking set up");
        Ok(report)
    }

    /// Detach a pod sandbox from all of its networks.
    ///
    /// Every selected network is visited, in reverse attach order, even
    /// when an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns `SandboxNotFound`, `PodNotFound` or `NoNetworksAvailable`
    /// before any plugin runs. Plugin failures are reported per network in
    /// the [`TeardownReport`].
    pub async fn tear_down_pod(
        &self,
        namespace: &str,
        name: &str,
        sandbox_id: &SandboxId,
    ) -> PodnetResult<TeardownReport> {
        let (pod, netns, selection) = self.resolve(namespace, name, sandbox_id).await?;
        let key = pod.key();

        tracing::info!(pod = %key, networks = ?selection.names(), "Tearing down pod networking");

        let mut outcomes = Vec::with_capacity(selection.len());
        for network in selection.detach_order() {
            let outcome = match self
                .invoker
                .detach(network, &pod, &netns, self.plugin_timeout)
                .await
            {
                Ok(()) => {
                    if let Err(e) = self.ledger.forget(&key, &network.name).await {
                        tracing::warn!(pod = %key, network = %network.name, error = %e, "Failed to update attachment ledger");
                    }
                    DetachOutcome::Detached
                }
                Err(e) => {
                    tracing::warn!(pod = %key, network = %network.name, error = %e, "Detach failed, continuing");
                    DetachOutcome::Failed(plugin_error(&network.name, e))
                }
            };
            outcomes.push((network.name.clone(), outcome));
        }

        let report = TeardownReport { pod: key, outcomes };
        if report.is_complete() {
            tracing::info!(pod = %report.pod, "Pod networking torn down");
        }
        Ok(report)
    }

    /// The pod's recorded primary address.
    ///
    /// # Errors
    ///
    /// Returns `PodNotFound`, or `MalformedAddress` if the recorded value
    /// does not parse.
    pub async fn status(&self, namespace: &str, name: &str) -> PodnetResult<Option<IpAddr>> {
        let pod = self.host.get_pod_by_name(namespace, name).await?;
        match pod.pod_ip.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => raw
                .parse::<IpAddr>()
                .map(Some)
                .map_err(|_| PodnetError::MalformedAddress {
                    value: raw.to_string(),
                }),
        }
    }

    /// Attachments recorded for a pod sandbox, in attach order.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger entry cannot be read.
    pub async fn attachments(&self, key: &PodKey) -> PodnetResult<Vec<AttachmentResult>> {
        self.ledger.attachments(key).await
    }

    async fn resolve(
        &self,
        namespace: &str,
        name: &str,
        sandbox_id: &SandboxId,
    ) -> PodnetResult<(PodIdentity, PathBuf, PodNetworkSelection)> {
        let netns = self.host.get_net_ns(sandbox_id).await?;
        let mut pod = self.host.get_pod_by_name(namespace, name).await?;
        pod.sandbox_id = sandbox_id.clone();
        let selection = self.selector.select_for(&pod).await?;
        Ok((pod, netns, selection))
    }

    async fn attach(
        &self,
        network: &NetworkDefinition,
        pod: &PodIdentity,
        netns: &Path,
    ) -> PodnetResult<AttachmentResult> {
        self.invoker
            .attach(network, pod, netns, self.plugin_timeout)
            .await
            .map_err(|e| {
                tracing::error!(pod = %pod.name, network = %network.name, error = %e, "Error adding network");
                plugin_error(&network.name, e)
            })
    }
}

/// Keep plugin and deadline errors, attribute anything else to the network.
fn plugin_error(network: &str, err: PodnetError) -> PodnetError {
    match err {
        PodnetError::PluginFailure { .. } | PodnetError::DeadlineExceeded { .. } => err,
        other => PodnetError::plugin(network, other.to_string()),
    }
}
