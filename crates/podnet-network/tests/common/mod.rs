//! In-memory runtime, plugin and switch used by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use podnet_common::{PodnetError, PodnetResult, SandboxId};
use podnet_network::{
    AttachmentResult, FlowRule, NetworkCatalog, NetworkConfig, NetworkDefinition, PluginInvoker,
    PodIdentity, RuntimeHost, SwitchControl,
};
use tempfile::TempDir;

/// Write network definitions into a fresh directory and open a catalog on it.
pub fn catalog_with(networks: &[(&str, &str)]) -> (TempDir, Arc<NetworkCatalog>) {
    let dir = tempfile::tempdir().unwrap();
    for (file, name) in networks {
        std::fs::write(
            dir.path().join(file),
            format!(r#"{{"cniVersion": "0.3.1", "name": "{name}", "type": "bridge"}}"#),
        )
        .unwrap();
    }
    let config = NetworkConfig::default()
        .with_conf_dir(dir.path())
        .with_bin_dir(dir.path().join("bin"));
    (dir, Arc::new(NetworkCatalog::new(&config)))
}

pub fn sandbox(id: &str) -> SandboxId {
    SandboxId::new(id).unwrap()
}

/// Pods, sandboxes and container markers held in memory.
#[derive(Default)]
pub struct FakeHost {
    pods: Mutex<HashMap<(String, String), PodIdentity>>,
    sandboxes: Mutex<HashMap<SandboxId, PathBuf>>,
    markers: Mutex<HashMap<(String, String), Vec<String>>>,
    ip_updates: Mutex<Vec<String>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a pod and a live sandbox for it.
    pub fn add_pod(&self, pod: PodIdentity) {
        self.sandboxes.lock().insert(
            pod.sandbox_id.clone(),
            PathBuf::from(format!("/var/run/netns/{}", pod.sandbox_id)),
        );
        self.pods
            .lock()
            .insert((pod.namespace.clone(), pod.name.clone()), pod);
    }

    pub fn set_pod_ip(&self, namespace: &str, name: &str, ip: &str) {
        if let Some(pod) = self
            .pods
            .lock()
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            pod.pod_ip = Some(ip.to_string());
        }
    }

    pub fn pod_ip(&self, namespace: &str, name: &str) -> Option<String> {
        self.pods
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|pod| pod.pod_ip.clone())
    }

    pub fn ip_updates(&self) -> Vec<String> {
        self.ip_updates.lock().clone()
    }

    /// Mark containers of `namespace/pod_name` as owning `ports`.
    pub fn mark_ports(&self, namespace: &str, pod_name: &str, ports: &[&str]) {
        self.markers.lock().insert(
            (namespace.to_string(), pod_name.to_string()),
            ports.iter().map(ToString::to_string).collect(),
        );
    }
}

#[async_trait]
impl RuntimeHost for FakeHost {
    async fn get_net_ns(&self, sandbox_id: &SandboxId) -> PodnetResult<PathBuf> {
        self.sandboxes
            .lock()
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| PodnetError::SandboxNotFound {
                id: sandbox_id.to_string(),
            })
    }

    async fn get_pod_by_name(&self, namespace: &str, name: &str) -> PodnetResult<PodIdentity> {
        self.pods
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| PodnetError::PodNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn update_pod_ip(&self, namespace: &str, name: &str, ip: &str) -> PodnetResult<()> {
        self.ip_updates.lock().push(ip.to_string());
        self.set_pod_ip(namespace, name, ip);
        Ok(())
    }

    async fn find_ports_by_pod_marker(&self, namespace: &str, pod_name: &str) -> PodnetResult<Vec<String>> {
        Ok(self
            .markers
            .lock()
            .get(&(namespace.to_string(), pod_name.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Attach,
    Detach,
}

/// Plugin stand-in with scripted addresses and failures.
#[derive(Default)]
pub struct FakeInvoker {
    addresses: Mutex<HashMap<String, IpNetwork>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(Call, String)>>,
}

impl FakeInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn assign(&self, network: &str, address: &str) {
        self.addresses
            .lock()
            .insert(network.to_string(), address.parse().unwrap());
    }

    pub fn fail(&self, network: &str) {
        self.failing.lock().insert(network.to_string());
    }

    pub fn heal(&self, network: &str) {
        self.failing.lock().remove(network);
    }

    pub fn calls(&self) -> Vec<(Call, String)> {
        self.calls.lock().clone()
    }

    pub fn networks_called(&self, call: Call) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(c, _)| *c == call)
            .map(|(_, network)| network.clone())
            .collect()
    }

    fn record(&self, call: Call, network: &NetworkDefinition) -> PodnetResult<()> {
        self.calls.lock().push((call, network.name.clone()));
        if self.failing.lock().contains(&network.name) {
            return Err(PodnetError::plugin(&network.name, "plugin exited with status 1"));
        }
        Ok(())
    }
}

#[async_trait]
impl PluginInvoker for FakeInvoker {
    async fn attach(
        &self,
        network: &NetworkDefinition,
        _pod: &PodIdentity,
        _netns: &Path,
        _timeout: Duration,
    ) -> PodnetResult<AttachmentResult> {
        self.record(Call::Attach, network)?;
        let address = self.addresses.lock().get(&network.name).copied();
        let (ip4, ip6) = match address {
            Some(net) if net.is_ipv4() => (Some(net), None),
            Some(net) => (None, Some(net)),
            None => (None, None),
        };
        Ok(AttachmentResult::new(&network.name, ip4, ip6))
    }

    async fn detach(
        &self,
        network: &NetworkDefinition,
        _pod: &PodIdentity,
        _netns: &Path,
        _timeout: Duration,
    ) -> PodnetResult<()> {
        self.record(Call::Detach, network)
    }
}

/// Switch stand-in with Open vSwitch replace and delete semantics.
///
/// Rules are keyed by table, priority and match, so adding an identical
/// rule replaces it. Deletion requires the exact cookie and match.
#[derive(Default)]
pub struct FakeSwitch {
    flows: Mutex<BTreeMap<(u8, u16, String), FlowRule>>,
    ports: Mutex<BTreeMap<String, u32>>,
    next_ofport: Mutex<u32>,
    delay: Option<Duration>,
    failing_ports: Mutex<HashSet<String>>,
}

impl FakeSwitch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A switch whose every command takes `delay`.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn plug(&self, port: &str) -> u32 {
        let mut next = self.next_ofport.lock();
        *next += 1;
        self.ports.lock().insert(port.to_string(), *next);
        *next
    }

    pub fn fail_port(&self, port: &str) {
        self.failing_ports.lock().insert(port.to_string());
    }

    pub fn has_port(&self, port: &str) -> bool {
        self.ports.lock().contains_key(port)
    }

    pub fn flows(&self) -> Vec<FlowRule> {
        self.flows.lock().values().cloned().collect()
    }

    pub fn flows_with_cookie(&self, cookie: u64) -> Vec<FlowRule> {
        self.flows
            .lock()
            .values()
            .filter(|rule| rule.cookie == cookie)
            .cloned()
            .collect()
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SwitchControl for FakeSwitch {
    async fn add_flow(&self, rule: &FlowRule) -> PodnetResult<()> {
        self.pause().await;
        self.flows.lock().insert(
            (rule.table, rule.priority, rule.matches.clone()),
            rule.clone(),
        );
        Ok(())
    }

    async fn del_flows(&self, rule: &FlowRule) -> PodnetResult<()> {
        self.pause().await;
        self.flows.lock().retain(|_, existing| {
            !(existing.table == rule.table
                && existing.cookie == rule.cookie
                && existing.matches == rule.matches)
        });
        Ok(())
    }

    async fn del_port_flows(&self, ofport: u32) -> PodnetResult<()> {
        self.pause().await;
        let from_port = format!("in_port={ofport}");
        let to_port = format!("output:{ofport}");
        self.flows.lock().retain(|_, rule| {
            !((rule.table == 0 && rule.matches.split(',').any(|m| m == from_port))
                || (rule.table == 1 && rule.actions.split(',').any(|a| a == to_port)))
        });
        Ok(())
    }

    async fn add_port(&self, port: &str) -> PodnetResult<()> {
        self.pause().await;
        if !self.has_port(port) {
            self.plug(port);
        }
        Ok(())
    }

    async fn del_port(&self, port: &str) -> PodnetResult<()> {
        self.pause().await;
        if self.failing_ports.lock().contains(port) {
            return Err(PodnetError::switch("del-port", format!("cannot remove {port}")));
        }
        self.ports.lock().remove(port);
        Ok(())
    }

    async fn port_exists(&self, port: &str) -> PodnetResult<bool> {
        self.pause().await;
        Ok(self.has_port(port))
    }

    async fn ofport(&self, port: &str) -> PodnetResult<u32> {
        self.pause().await;
        self.ports
            .lock()
            .get(port)
            .copied()
            .ok_or_else(|| PodnetError::switch("get-ofport", format!("no port {port}")))
    }
}
