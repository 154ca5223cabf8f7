//! Tenant isolation rules on the shared switch.
//!
//! Every pod wired to the switch gets three rules, all carrying the tenant's
//! VNID as cookie:
//!
//! | table | match                          | action                         |
//! |-------|--------------------------------|--------------------------------|
//! | 0     | `in_port=<ofport>`             | set tunnel ID to VNID, table 1 |
//! | 1     | `tun_id=<vnid>,dl_dst=<mac>`   | output to the pod's port       |
//! | 1     | `arp,tun_id=<vnid>,nw_dst=<ip>`| output to the pod's port       |
//!
//! Packets only reach a pod when they carry its tenant's tunnel ID, so ARP
//! and unicast stay inside the tenant. Deletion matches the exact cookie and
//! the same predicates, which makes it safe to repeat and leaves other
//! tenants' rules alone.

use std::fmt::Write as _;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use macaddr::MacAddr6;
use podnet_common::{PodnetError, PodnetResult, Vnid};
use serde::{Deserialize, Serialize};

use crate::pod::RuntimeHost;
use crate::port_store::{PortRecord, PortStore};
use crate::switch::SwitchControl;

/// Priority of all tenant rules.
pub const RULE_PRIORITY: u16 = 100;
/// Table classifying traffic leaving pods.
pub const TAG_TABLE: u8 = 0;
/// Table delivering tagged traffic to pods.
pub const DELIVERY_TABLE: u8 = 1;

/// A pod's port on the switch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwitchPort {
    /// Port (host-side interface) name.
    pub name: String,
    /// OpenFlow port number.
    pub ofport: u32,
}

impl SwitchPort {
    /// Create a port handle.
    pub fn new(name: impl Into<String>, ofport: u32) -> Self {
        Self {
            name: name.into(),
            ofport,
        }
    }
}

/// A tenant endpoint: who the pod is on the tenant network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantEndpoint {
    /// Tenant identifier.
    pub vnid: Vnid,
    /// Pod MAC address.
    pub mac: MacAddr6,
    /// Pod IPv4 address.
    pub ip: Ipv4Addr,
}

/// The parameters all three rules of one pod derive from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRuleSet {
    /// Tenant identifier, also the rule cookie.
    pub vnid: Vnid,
    /// Pod MAC address.
    pub mac: MacAddr6,
    /// Pod IPv4 address.
    pub ip: Ipv4Addr,
    /// Pod switch port.
    pub port: SwitchPort,
}

impl FlowRuleSet {
    /// Create a rule set.
    #[must_use]
    pub const fn new(vnid: Vnid, mac: MacAddr6, ip: Ipv4Addr, port: SwitchPort) -> Self {
        Self { vnid, mac, ip, port }
    }

    /// Create a rule set for `endpoint` behind `port`.
    #[must_use]
    pub const fn for_endpoint(endpoint: TenantEndpoint, port: SwitchPort) -> Self {
        Self::new(endpoint.vnid, endpoint.mac, endpoint.ip, port)
    }

    /// Cookie shared by the three rules.
    #[must_use]
    pub const fn cookie(&self) -> u64 {
        self.vnid.cookie()
    }

    /// The three rules, in install order.
    #[must_use]
    pub fn rules(&self) -> [FlowRule; 3] {
        let cookie = self.cookie();
        let vnid = self.vnid.get();
        let ofport = self.port.ofport;
        [
            FlowRule {
                table: TAG_TABLE,
                cookie,
                priority: RULE_PRIORITY,
                matches: format!("in_port={ofport}"),
                actions: format!("load:{vnid}->NXM_NX_TUN_ID[0..31],goto_table:{DELIVERY_TABLE}"),
            },
            FlowRule {
                table: DELIVERY_TABLE,
                cookie,
                priority: RULE_PRIORITY,
                matches: format!("tun_id={vnid:#x},dl_dst={}", mac_string(&self.mac)),
                actions: format!("output:{ofport}"),
            },
            FlowRule {
                table: DELIVERY_TABLE,
                cookie,
                priority: RULE_PRIORITY,
                matches: format!("arp,tun_id={vnid:#x},nw_dst={}", self.ip),
                actions: format!("output:{ofport}"),
            },
        ]
    }
}

/// One switch rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowRule {
    /// Table number.
    pub table: u8,
    /// Cookie (tenant VNID).
    pub cookie: u64,
    /// Priority.
    pub priority: u16,
    /// Match predicate, `ovs-ofctl` syntax.
    pub matches: String,
    /// Actions, `ovs-ofctl` syntax.
    pub actions: String,
}

impl FlowRule {
    /// Flow spec for `ovs-ofctl add-flow`.
    #[must_use]
    pub fn add_spec(&self) -> String {
        format!(
            "table={},cookie={:#x},priority={},{},actions={}",
            self.table, self.cookie, self.priority, self.matches, self.actions
        )
    }

    /// Flow spec for `ovs-ofctl del-flows`, exact cookie match.
    #[must_use]
    pub fn delete_spec(&self) -> String {
        format!("table={},cookie={:#x}/-1,{}", self.table, self.cookie, self.matches)
    }
}

/// Parse a colon- or dash-separated MAC address.
///
/// # Errors
///
/// Returns [`PodnetError::InvalidMacAddress`] if `value` is not six hex octets.
pub fn parse_mac(value: &str) -> PodnetResult<MacAddr6> {
    value.trim().parse().map_err(|_| PodnetError::InvalidMacAddress {
        value: value.to_string(),
    })
}

/// Lowercase colon-separated MAC, as `ovs-ofctl` prints it.
fn mac_string(mac: &MacAddr6) -> String {
    let mut out = String::with_capacity(17);
    for (i, byte) in mac.as_bytes().iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Outcome of a pod's switch teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortCleanup {
    /// Whether recorded rules were removed.
    pub rules_removed: bool,
    /// Ports detached from the bridge.
    pub detached: Vec<String>,
    /// Ports that were no longer on the bridge.
    pub already_removed: Vec<String>,
}

/// Installs and removes tenant rules and pod ports.
pub struct FlowController {
    switch: Arc<dyn SwitchControl>,
    store: PortStore,
    host: Arc<dyn RuntimeHost>,
}

impl FlowController {
    /// Create a controller.
    pub fn new(switch: Arc<dyn SwitchControl>, store: PortStore, host: Arc<dyn RuntimeHost>) -> Self {
        Self {
            switch,
            store,
            host,
        }
    }

    /// The port record store.
    #[must_use]
    pub const fn store(&self) -> &PortStore {
        &self.store
    }

    /// Install the three rules of `rules`.
    ///
    /// Reinstalling identical rules replaces them in place.
    ///
    /// # Errors
    ///
    /// Returns `SwitchCommandFailure` or `DeadlineExceeded`.
    pub async fn install(&self, rules: &FlowRuleSet, timeout: Duration) -> PodnetResult<()> {
        with_deadline("install flows", timeout, self.install_rules(rules)).await?;
        tracing::info!(vnid = %rules.vnid, port = %rules.port.name, ip = %rules.ip, "Tenant flows installed");
        Ok(())
    }

    /// Remove the three rules of `rules`. Removing absent rules succeeds.
    ///
    /// # Errors
    ///
    /// Returns `SwitchCommandFailure` or `DeadlineExceeded`.
    pub async fn remove(&self, rules: &FlowRuleSet, timeout: Duration) -> PodnetResult<()> {
        with_deadline("remove flows", timeout, self.remove_rules(rules)).await?;
        tracing::info!(vnid = %rules.vnid, port = %rules.port.name, "Tenant flows removed");
        Ok(())
    }

    /// Wire a pod's host-side interface to the switch and isolate it.
    ///
    /// Attaches `port` to the bridge, installs the tenant rules, and records
    /// the association for teardown.
    ///
    /// # Errors
    ///
    /// Returns `SwitchCommandFailure`, `DeadlineExceeded`, or an I/O error
    /// from the port store.
    pub async fn attach_pod(
        &self,
        namespace: &str,
        name: &str,
        port: &str,
        endpoint: TenantEndpoint,
        timeout: Duration,
    ) -> PodnetResult<FlowRuleSet> {
        let rules = with_deadline("attach pod port", timeout, async {
            self.switch.add_port(port).await?;
            let ofport = self.switch.ofport(port).await?;
            let rules = FlowRuleSet::for_endpoint(endpoint, SwitchPort::new(port, ofport));
            self.install_rules(&rules).await?;
            Ok::<_, PodnetError>(rules)
        })
        .await?;

        self.store
            .save(&PortRecord {
                namespace: namespace.to_string(),
                name: name.to_string(),
                flows: rules.clone(),
            })
            .await?;

        tracing::info!(
            namespace,
            pod = name,
            port,
            ofport = rules.port.ofport,
            vnid = %rules.vnid,
            "Pod port attached"
        );
        Ok(rules)
    }

    /// Remove a pod's rules and detach its port.
    ///
    /// Uses the recorded association when there is one. Otherwise asks the
    /// runtime for ports of the pod's containers; no match means the pod is
    /// already cleaned up.
    ///
    /// Before a port leaves the bridge, every rule reading from or writing
    /// to its OpenFlow port number is removed, so a port that later gets the
    /// same number starts without the old tenant's tag.
    ///
    /// # Errors
    ///
    /// Every port is processed; the first failure is returned afterwards and
    /// the record is kept for a retry.
    pub async fn detach_pod(&self, namespace: &str, name: &str, timeout: Duration) -> PodnetResult<PortCleanup> {
        let record = self.store.load(namespace, name).await?;

        let cleanup = with_deadline("detach pod port", timeout, async {
            let mut cleanup = PortCleanup::default();
            let ports = match &record {
                Some(record) => {
                    self.remove_rules(&record.flows).await?;
                    cleanup.rules_removed = true;
                    vec![record.flows.port.name.clone()]
                }
                None => {
                    let ports = self.host.find_ports_by_pod_marker(namespace, name).await?;
                    tracing::debug!(namespace, pod = name, ?ports, "No port record, found ports by pod marker");
                    ports
                }
            };
            self.detach_ports(ports, &mut cleanup).await?;
            Ok::<_, PodnetError>(cleanup)
        })
        .await?;

        if record.is_some() {
            self.store.delete(namespace, name).await?;
        }

        tracing::info!(
            namespace,
            pod = name,
            detached = ?cleanup.detached,
            already_removed = ?cleanup.already_removed,
            "Pod port detached"
        );
        Ok(cleanup)
    }

    async fn install_rules(&self, rules: &FlowRuleSet) -> PodnetResult<()> {
        for rule in rules.rules() {
            self.switch.add_flow(&rule).await?;
        }
        Ok(())
    }

    async fn remove_rules(&self, rules: &FlowRuleSet) -> PodnetResult<()> {
        for rule in rules.rules() {
            self.switch.del_flows(&rule).await?;
        }
        Ok(())
    }

    async fn detach_ports(&self, ports: Vec<String>, cleanup: &mut PortCleanup) -> PodnetResult<()> {
        let outcomes = join_all(ports.into_iter().map(|port| async move {
            let detached = self.detach_port(&port).await;
            (port, detached)
        }))
        .await;

        let mut first_error = None;
        for (port, outcome) in outcomes {
            match outcome {
                Ok(true) => cleanup.detached.push(port),
                Ok(false) => cleanup.already_removed.push(port),
                Err(e) => {
                    tracing::warn!(%port, error = %e, "Failed to detach port");
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn detach_port(&self, port: &str) -> PodnetResult<bool> {
        if !self.switch.port_exists(port).await? {
            return Ok(false);
        }
        let ofport = self.switch.ofport(port).await?;
        self.switch.del_port_flows(ofport).await?;
        self.switch.del_port(port).await?;
        Ok(true)
    }
}

async fn with_deadline<T>(
    operation: &str,
    timeout: Duration,
    work: impl Future<Output = PodnetResult<T>>,
) -> PodnetResult<T> {
    tokio::time::timeout(timeout, work)
        .await
        .map_err(|_| PodnetError::DeadlineExceeded {
            operation: operation.to_string(),
            timeout,
        })?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_set() -> FlowRuleSet {
        FlowRuleSet::new(
            Vnid::new(42),
            "aa:bb:cc:dd:ee:ff".parse().unwrap(),
            Ipv4Addr::new(10, 0, 0, 5),
            SwitchPort::new("vnet3", 3),
        )
    }

    #[test]
    fn three_rules_share_the_cookie() {
        let rules = rule_set().rules();
        assert!(rules.iter().all(|r| r.cookie == 42));
        assert_eq!(
            rules.iter().map(|r| r.table).collect::<Vec<_>>(),
            [TAG_TABLE, DELIVERY_TABLE, DELIVERY_TABLE]
        );
    }

    #[test]
    fn add_specs() {
        let [tag, redirect, arp] = rule_set().rules();
        assert_eq!(
            tag.add_spec(),
            "table=0,cookie=0x2a,priority=100,in_port=3,actions=load:42->NXM_NX_TUN_ID[0..31],goto_table:1"
        );
        assert_eq!(
            redirect.add_spec(),
            "table=1,cookie=0x2a,priority=100,tun_id=0x2a,dl_dst=aa:bb:cc:dd:ee:ff,actions=output:3"
        );
        assert_eq!(
            arp.add_spec(),
            "table=1,cookie=0x2a,priority=100,arp,tun_id=0x2a,nw_dst=10.0.0.5,actions=output:3"
        );
    }

    #[test]
    fn delete_specs_match_exact_cookie() {
        let [tag, redirect, arp] = rule_set().rules();
        assert_eq!(tag.delete_spec(), "table=0,cookie=0x2a/-1,in_port=3");
        assert_eq!(
            redirect.delete_spec(),
            "table=1,cookie=0x2a/-1,tun_id=0x2a,dl_dst=aa:bb:cc:dd:ee:ff"
        );
        assert_eq!(arp.delete_spec(), "table=1,cookie=0x2a/-1,arp,tun_id=0x2a,nw_dst=10.0.0.5");
    }

    #[test]
    fn mac_rendering_is_lowercase() {
        let mac: MacAddr6 = "AA:0B:CC:0D:EE:0F".parse().unwrap();
        assert_eq!(mac_string(&mac), "aa:0b:cc:0d:ee:0f");
    }

    #[test]
    fn mac_parsing() {
        assert_eq!(parse_mac(" aa-bb-cc-dd-ee-ff").unwrap(), rule_set().mac);
        assert!(matches!(
            parse_mac("aa:bb:cc"),
            Err(PodnetError::InvalidMacAddress { value }) if value == "aa:bb:cc"
        ));
    }

    #[test]
    fn rule_set_serde() {
        let json = serde_json::to_value(rule_set()).unwrap();
        assert_eq!(json["vnid"], 42);
        assert_eq!(json["port"]["name"], "vnet3");
        let back: FlowRuleSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule_set());
    }
}
