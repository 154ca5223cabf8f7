//! Network plugin invocation.
//!
//! One call attaches (or detaches) one pod to (or from) one network.
//! [`CniInvoker`] speaks the CNI exec protocol: the plugin binary gets its
//! parameters in `CNI_*` environment variables, the network configuration
//! on stdin, and answers with a JSON result on stdout.
//!
//! Nothing here retries. Plugins must make `ADD` of an already attached pod
//! and `DEL` of an already detached pod harmless.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use podnet_common::{PodnetError, PodnetResult};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::catalog::NetworkDefinition;
use crate::command;
use crate::config::NetworkConfig;
use crate::pod::PodIdentity;

/// Plugin argument carrying the pod namespace.
pub const ARG_POD_NAMESPACE: &str = "K8S_POD_NAMESPACE";
/// Plugin argument carrying the pod name.
pub const ARG_POD_NAME: &str = "K8S_POD_NAME";
/// Plugin argument carrying the sandbox ID.
pub const ARG_POD_INFRA_CONTAINER_ID: &str = "K8S_POD_INFRA_CONTAINER_ID";

static NEXT_ASSIGNMENT: AtomicU64 = AtomicU64::new(1);

/// Addresses a plugin assigned to one pod on one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentResult {
    /// Network name.
    pub network: String,
    /// Assigned IPv4 address with prefix.
    pub ip4: Option<IpNetwork>,
    /// Assigned IPv6 address with prefix.
    pub ip6: Option<IpNetwork>,
    /// Logical timestamp, increasing across the process.
    pub assigned_at: u64,
}

impl AttachmentResult {
    /// Record a fresh assignment.
    pub fn new(network: impl Into<String>, ip4: Option<IpNetwork>, ip6: Option<IpNetwork>) -> Self {
        Self {
            network: network.into(),
            ip4,
            ip6,
            assigned_at: NEXT_ASSIGNMENT.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// The pod's primary address on this network: IPv4 if any, else IPv6.
    #[must_use]
    pub fn primary_ip(&self) -> Option<IpAddr> {
        self.ip4.or(self.ip6).map(|net| net.ip())
    }
}

/// Runtime parameters of one plugin invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConf {
    /// Sandbox (infra container) ID.
    pub container_id: String,
    /// Network namespace handle.
    pub netns: PathBuf,
    /// Interface to create inside the namespace.
    pub if_name: String,
    /// Ordered key/value arguments for the plugin's own bookkeeping.
    pub args: Vec<(String, String)>,
}

impl RuntimeConf {
    /// Build the runtime parameters for `pod`.
    #[must_use]
    pub fn for_pod(pod: &PodIdentity, netns: &Path, if_name: &str) -> Self {
        tracing::trace!(pod = %pod.name, netns = %netns.display(), "Building runtime conf");
        Self {
            container_id: pod.sandbox_id.to_string(),
            netns: netns.to_path_buf(),
            if_name: if_name.to_string(),
            args: vec![
                (ARG_POD_NAMESPACE.to_string(), pod.namespace.clone()),
                (ARG_POD_NAME.to_string(), pod.name.clone()),
                (ARG_POD_INFRA_CONTAINER_ID.to_string(), pod.sandbox_id.to_string()),
            ],
        }
    }

    /// Arguments rendered as `CNI_ARGS`.
    #[must_use]
    pub fn cni_args(&self) -> String {
        self.args
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Attach and detach pods through a network's plugin.
#[async_trait]
pub trait PluginInvoker: Send + Sync {
    /// Attach `pod` to `network`.
    async fn attach(
        &self,
        network: &NetworkDefinition,
        pod: &PodIdentity,
        netns: &Path,
        timeout: Duration,
    ) -> PodnetResult<AttachmentResult>;

    /// Detach `pod` from `network`.
    async fn detach(
        &self,
        network: &NetworkDefinition,
        pod: &PodIdentity,
        netns: &Path,
        timeout: Duration,
    ) -> PodnetResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CniCommand {
    Add,
    Del,
}

impl CniCommand {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Del => "DEL",
        }
    }
}

/// Executes CNI plugin binaries.
#[derive(Debug, Clone)]
pub struct CniInvoker {
    if_name: String,
}

impl CniInvoker {
    /// Create an invoker creating `if_name` inside pod namespaces.
    pub fn new(if_name: impl Into<String>) -> Self {
        Self {
            if_name: if_name.into(),
        }
    }

    /// Create an invoker from configuration.
    #[must_use]
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(config.interface_name.clone())
    }

    /// Locate the plugin binary of `network`.
    ///
    /// # Errors
    ///
    /// Returns [`PodnetError::PluginFailure`] if no search path holds it.
    pub fn find_plugin(network: &NetworkDefinition) -> PodnetResult<PathBuf> {
        network
            .plugin_search_paths
            .iter()
            .map(|dir| dir.join(&network.plugin_type))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                PodnetError::plugin(
                    &network.name,
                    format!(
                        "failed to find plugin {:?} in path {:?}",
                        network.plugin_type, network.plugin_search_paths
                    ),
                )
            })
    }

    async fn exec(
        &self,
        cni_command: CniCommand,
        network: &NetworkDefinition,
        pod: &PodIdentity,
        netns: &Path,
        timeout: Duration,
    ) -> PodnetResult<Vec<u8>> {
        let plugin = Self::find_plugin(network)?;
        let rt = RuntimeConf::for_pod(pod, netns, &self.if_name);
        let cni_path = std::env::join_paths(&network.plugin_search_paths)
            .map_err(|e| PodnetError::plugin(&network.name, e.to_string()))?;
        let stdin = serde_json::to_vec(&network.raw_config)?;

        tracing::debug!(
            network = %network.name,
            plugin = %plugin.display(),
            command = cni_command.as_str(),
            container_id = %rt.container_id,
            netns = %rt.netns.display(),
            "Invoking network plugin"
        );

        let mut cmd = Command::new(&plugin);
        cmd.env("CNI_COMMAND", cni_command.as_str())
            .env("CNI_CONTAINERID", &rt.container_id)
            .env("CNI_NETNS", &rt.netns)
            .env("CNI_IFNAME", &rt.if_name)
            .env("CNI_ARGS", rt.cni_args())
            .env("CNI_PATH", cni_path);

        let operation = format!("{} {}", cni_command.as_str(), network.name);
        let output = command::run(cmd, Some(&stdin), &operation, timeout)
            .await
            .map_err(|e| match e {
                PodnetError::Io(io) => PodnetError::plugin(&network.name, io.to_string()),
                other => other,
            })?;

        if !output.status.success() {
            let cause = plugin_error_message(&output.stdout)
                .unwrap_or_else(|| command::failure_text(&output));
            tracing::error!(network = %network.name, command = cni_command.as_str(), %cause, "Network plugin failed");
            return Err(PodnetError::plugin(&network.name, cause));
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl PluginInvoker for CniInvoker {
    async fn attach(
        &self,
        network: &NetworkDefinition,
        pod: &PodIdentity,
        netns: &Path,
        timeout: Duration,
    ) -> PodnetResult<AttachmentResult> {
        let stdout = self
            .exec(CniCommand::Add, network, pod, netns, timeout)
            .await?;
        let result = parse_result(&network.name, &stdout)?;
        tracing::info!(
            network = %network.name,
            pod = %pod.name,
            ip = ?result.primary_ip(),
            "Pod attached to network"
        );
        Ok(result)
    }

    async fn detach(
        &self,
        network: &NetworkDefinition,
        pod: &PodIdentity,
        netns: &Path,
        timeout: Duration,
    ) -> PodnetResult<()> {
        self.exec(CniCommand::Del, network, pod, netns, timeout)
            .await?;
        tracing::info!(network = %network.name, pod = %pod.name, "Pod detached from network");
        Ok(())
    }
}

#[derive(Deserialize)]
struct LegacyIpConfig {
    ip: IpNetwork,
}

#[derive(Deserialize)]
struct IpConfig {
    address: IpNetwork,
}

/// Plugin result, either the legacy `ip4`/`ip6` shape or the `ips` list.
#[derive(Deserialize)]
struct CniResult {
    #[serde(default)]
    ip4: Option<LegacyIpConfig>,
    #[serde(default)]
    ip6: Option<LegacyIpConfig>,
    #[serde(default)]
    ips: Vec<IpConfig>,
}

#[derive(Deserialize)]
struct CniErrorBody {
    msg: String,
    #[serde(default)]
    details: String,
}

fn parse_result(network: &str, stdout: &[u8]) -> PodnetResult<AttachmentResult> {
    let result: CniResult = serde_json::from_slice(stdout).map_err(|e| {
        PodnetError::plugin(network, format!("invalid plugin result: {e}"))
    })?;

    let ip4 = result
        .ip4
        .map(|c| c.ip)
        .or_else(|| result.ips.iter().map(|c| c.address).find(IpNetwork::is_ipv4));
    let ip6 = result
        .ip6
        .map(|c| c.ip)
        .or_else(|| result.ips.iter().map(|c| c.address).find(IpNetwork::is_ipv6));

    if ip4.is_none() && ip6.is_none() {
        tracing::warn!(network, "Plugin result carries no address");
    }
    Ok(AttachmentResult::new(network, ip4, ip6))
}

fn plugin_error_message(stdout: &[u8]) -> Option<String> {
    let body: CniErrorBody = serde_json::from_slice(stdout).ok()?;
    if body.details.is_empty() {
        Some(body.msg)
    } else {
        Some(format!("{}: {}", body.msg, body.details))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podnet_common::SandboxId;

    fn pod() -> PodIdentity {
        PodIdentity::new("tenant-a", "web-0", SandboxId::new("f00dcafe").unwrap())
    }

    #[test]
    fn runtime_conf_carries_pod_args_in_order() {
        let rt = RuntimeConf::for_pod(&pod(), Path::new("/var/run/netns/f00dcafe"), "eth0");
        assert_eq!(rt.container_id, "f00dcafe");
        assert_eq!(rt.if_name, "eth0");
        assert_eq!(
            rt.cni_args(),
            "K8S_POD_NAMESPACE=tenant-a;K8S_POD_NAME=web-0;K8S_POD_INFRA_CONTAINER_ID=f00dcafe"
        );
    }

    #[test]
    fn legacy_result() {
        let result = parse_result(
            "a",
            br#"{"ip4": {"ip": "10.1.0.5/24", "gateway": "10.1.0.1"}, "ip6": {"ip": "fd00::5/64"}}"#,
        )
        .unwrap();
        assert_eq!(result.network, "a");
        assert_eq!(result.ip4.unwrap().to_string(), "10.1.0.5/24");
        assert_eq!(result.primary_ip().unwrap().to_string(), "10.1.0.5");
    }

    #[test]
    fn ips_list_result() {
        let result = parse_result(
            "a",
            br#"{"cniVersion": "1.0.0", "ips": [{"address": "fd00::7/64"}, {"address": "10.2.0.7/16"}]}"#,
        )
        .unwrap();
        assert_eq!(result.ip4.unwrap().to_string(), "10.2.0.7/16");
        assert_eq!(result.ip6.unwrap().to_string(), "fd00::7/64");
    }

    #[test]
    fn ipv6_only_result_uses_ipv6_primary() {
        let result = parse_result("a", br#"{"ip6": {"ip": "fd00::9/64"}}"#).unwrap();
        assert_eq!(result.primary_ip().unwrap().to_string(), "fd00::9");
    }

    #[test]
    fn garbage_result_is_plugin_failure() {
        let err = parse_result("a", b"not json").unwrap_err();
        assert!(matches!(err, PodnetError::PluginFailure { network, .. } if network == "a"));
    }

    #[test]
    fn assignments_are_ordered() {
        let first = AttachmentResult::new("a", None, None);
        let second = AttachmentResult::new("b", None, None);
        assert!(second.assigned_at > first.assigned_at);
    }

    #[test]
    fn error_body_message() {
        assert_eq!(
            plugin_error_message(br#"{"code": 11, "msg": "no IPs", "details": "pool exhausted"}"#),
            Some("no IPs: pool exhausted".to_string())
        );
        assert_eq!(plugin_error_message(b""), None);
    }

    #[test]
    fn missing_plugin_binary() {
        let network = NetworkDefinition {
            name: "a".to_string(),
            plugin_type: "podnet-no-such-plugin".to_string(),
            plugin_search_paths: vec![PathBuf::from("/nonexistent")],
            raw_config: serde_json::json!({"name": "a", "type": "podnet-no-such-plugin"}),
            source: PathBuf::from("/etc/cni/net.d/a.conf"),
        };
        let err = CniInvoker::find_plugin(&network).unwrap_err();
        assert!(matches!(err, PodnetError::PluginFailure { .. }));
    }
}

#[cfg(all(test, unix))]
mod exec_tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use podnet_common::SandboxId;
    use tempfile::TempDir;

    const NETNS: &str = "/var/run/netns/f00dcafe";

    /// Install `body` as the plugin binary of a network named `a`.
    fn script_network(body: &str) -> (TempDir, NetworkDefinition) {
        let dir = tempfile::tempdir().unwrap();
        let plugin = dir.path().join("podnet-test-plugin");
        std::fs::write(&plugin, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&plugin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let network = NetworkDefinition {
            name: "a".to_string(),
            plugin_type: "podnet-test-plugin".to_string(),
            plugin_search_paths: vec![dir.path().to_path_buf()],
            raw_config: serde_json::json!({"cniVersion": "0.3.1", "name": "a", "type": "podnet-test-plugin"}),
            source: dir.path().join("10-a.conf"),
        };
        (dir, network)
    }

    fn pod() -> PodIdentity {
        PodIdentity::new("tenant-a", "web-0", SandboxId::new("f00dcafe").unwrap())
    }

    const RECORDING_PLUGIN: &str = r#"here="$(dirname "$0")"
cat > "$here/stdin.json"
env | grep '^CNI_' | sort > "$here/env.txt"
if [ "$CNI_COMMAND" = "ADD" ]; then
  echo '{"ip4": {"ip": "10.1.0.5/24"}}'
fi"#;

    #[test_log::test(tokio::test)]
    async fn attach_passes_environment_and_config() {
        let (dir, network) = script_network(RECORDING_PLUGIN);
        let invoker = CniInvoker::new("eth0");

        let result = invoker
            .attach(&network, &pod(), Path::new(NETNS), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(result.network, "a");
        assert_eq!(result.ip4.unwrap().to_string(), "10.1.0.5/24");

        let env = std::fs::read_to_string(dir.path().join("env.txt")).unwrap();
        let env: Vec<&str> = env.lines().collect();
        assert!(env.contains(&"CNI_COMMAND=ADD"));
        assert!(env.contains(&"CNI_CONTAINERID=f00dcafe"));
        assert!(env.contains(&format!("CNI_NETNS={NETNS}").as_str()));
        assert!(env.contains(&"CNI_IFNAME=eth0"));
        assert!(env.contains(
            &"CNI_ARGS=K8S_POD_NAMESPACE=tenant-a;K8S_POD_NAME=web-0;K8S_POD_INFRA_CONTAINER_ID=f00dcafe"
        ));
        assert!(env.contains(&format!("CNI_PATH={}", dir.path().display()).as_str()));

        let stdin: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("stdin.json")).unwrap()).unwrap();
        assert_eq!(stdin, network.raw_config);
    }

    #[test_log::test(tokio::test)]
    async fn detach_runs_del() {
        let (dir, network) = script_network(RECORDING_PLUGIN);
        let invoker = CniInvoker::new("eth0");

        invoker
            .detach(&network, &pod(), Path::new(NETNS), Duration::from_secs(10))
            .await
            .unwrap();

        let env = std::fs::read_to_string(dir.path().join("env.txt")).unwrap();
        assert!(env.lines().any(|line| line == "CNI_COMMAND=DEL"));
    }

    #[test_log::test(tokio::test)]
    async fn error_body_becomes_plugin_failure() {
        let (_dir, network) = script_network(
            r#"echo '{"cniVersion": "0.3.1", "code": 11, "msg": "no IPs"}'
exit 1"#,
        );

        let err = CniInvoker::new("eth0")
            .attach(&network, &pod(), Path::new(NETNS), Duration::from_secs(10))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PodnetError::PluginFailure { network, cause } if network == "a" && cause == "no IPs"
        ));
    }

    #[test_log::test(tokio::test)]
    async fn failure_without_body_reports_stderr() {
        let (_dir, network) = script_network("echo 'bridge cni0 missing' >&2\nexit 2");

        let err = CniInvoker::new("eth0")
            .detach(&network, &pod(), Path::new(NETNS), Duration::from_secs(10))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PodnetError::PluginFailure { cause, .. } if cause == "bridge cni0 missing"
        ));
    }

    #[test_log::test(tokio::test)]
    async fn hung_plugin_hits_deadline() {
        let (_dir, network) = script_network("exec sleep 30");

        let err = CniInvoker::new("eth0")
            .attach(&network, &pod(), Path::new(NETNS), Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(err.is_deadline());
        assert!(matches!(
            err,
            PodnetError::DeadlineExceeded { timeout, .. } if timeout == Duration::from_millis(200)
        ));
    }
}
