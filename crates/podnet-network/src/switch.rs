//! Shared software switch control.
//!
//! [`SwitchControl`] is everything the flow layer needs from the switch.
//! [`OvsSwitch`] implements it for an Open vSwitch bridge by shelling out to
//! `ovs-ofctl` and `ovs-vsctl`; both serialize individual mutations, so
//! rules of different tenants can be changed concurrently.

use std::time::Duration;

use async_trait::async_trait;
use podnet_common::{PodnetError, PodnetResult};
use tokio::process::Command;

use crate::command;
use crate::config::NetworkConfig;
use crate::flow::{DELIVERY_TABLE, FlowRule, TAG_TABLE};

/// Operations on the node's shared switch.
///
/// Every mutation must be idempotent: adding an existing rule or port and
/// removing a missing one both succeed.
#[async_trait]
pub trait SwitchControl: Send + Sync {
    /// Install (or replace) a rule.
    async fn add_flow(&self, rule: &FlowRule) -> PodnetResult<()>;

    /// Remove rules matching the rule's table, exact cookie and match.
    async fn del_flows(&self, rule: &FlowRule) -> PodnetResult<()>;

    /// Remove every rule matching traffic from `ofport` in the tag table or
    /// delivering to it in the delivery table, whatever its cookie.
    async fn del_port_flows(&self, ofport: u32) -> PodnetResult<()>;

    /// Attach a port to the bridge.
    async fn add_port(&self, port: &str) -> PodnetResult<()>;

    /// Detach a port from the bridge.
    async fn del_port(&self, port: &str) -> PodnetResult<()>;

    /// Whether the port is attached to the bridge.
    async fn port_exists(&self, port: &str) -> PodnetResult<bool>;

    /// OpenFlow port number of an attached port.
    async fn ofport(&self, port: &str) -> PodnetResult<u32>;
}

/// An Open vSwitch bridge.
#[derive(Debug, Clone)]
pub struct OvsSwitch {
    /// Bridge name.
    bridge: String,
    /// Per-command deadline.
    timeout: Duration,
}

impl OvsSwitch {
    /// Control an existing bridge.
    pub fn new(bridge: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bridge: bridge.into(),
            timeout,
        }
    }

    /// Control the configured bridge.
    #[must_use]
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(config.bridge.clone(), config.switch_timeout())
    }

    /// Get the bridge name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.bridge
    }

    async fn ofctl(&self, operation: &str, spec: &str) -> PodnetResult<String> {
        let mut cmd = Command::new("ovs-ofctl");
        cmd.args(["-O", "OpenFlow13", operation, &self.bridge, spec]);
        self.execute(cmd, operation).await
    }

    async fn vsctl(&self, operation: &str, args: &[&str]) -> PodnetResult<String> {
        let mut cmd = Command::new("ovs-vsctl");
        cmd.args(args);
        self.execute(cmd, operation).await
    }

    async fn execute(&self, cmd: Command, operation: &str) -> PodnetResult<String> {
        let output = command::run(cmd, None, operation, self.timeout)
            .await
            .map_err(|e| match e {
                PodnetError::Io(io) => PodnetError::switch(operation, io.to_string()),
                other => other,
            })?;

        if !output.status.success() {
            return Err(PodnetError::switch(operation, command::failure_text(&output)));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SwitchControl for OvsSwitch {
    async fn add_flow(&self, rule: &FlowRule) -> PodnetResult<()> {
        let spec = rule.add_spec();
        tracing::debug!(bridge = %self.bridge, %spec, "Adding flow");
        self.ofctl("add-flow", &spec).await?;
        Ok(())
    }

    async fn del_flows(&self, rule: &FlowRule) -> PodnetResult<()> {
        let spec = rule.delete_spec();
        tracing::debug!(bridge = %self.bridge, %spec, "Deleting flows");
        self.ofctl("del-flows", &spec).await?;
        Ok(())
    }

    async fn del_port_flows(&self, ofport: u32) -> PodnetResult<()> {
        for spec in port_flow_specs(ofport) {
            tracing::debug!(bridge = %self.bridge, %spec, "Deleting port flows");
            self.ofctl("del-flows", &spec).await?;
        }
        Ok(())
    }

    async fn add_port(&self, port: &str) -> PodnetResult<()> {
        tracing::debug!(bridge = %self.bridge, port, "Adding port to bridge");
        self.vsctl("add-port", &["--may-exist", "add-port", &self.bridge, port])
            .await?;
        Ok(())
    }

    async fn del_port(&self, port: &str) -> PodnetResult<()> {
        tracing::debug!(bridge = %self.bridge, port, "Removing port from bridge");
        self.vsctl("del-port", &["--if-exists", "del-port", &self.bridge, port])
            .await?;
        Ok(())
    }

    async fn port_exists(&self, port: &str) -> PodnetResult<bool> {
        let ports = self.vsctl("list-ports", &["list-ports", &self.bridge]).await?;
        Ok(ports.lines().any(|line| line.trim() == port))
    }

    async fn ofport(&self, port: &str) -> PodnetResult<u32> {
        let raw = self
            .vsctl("get-ofport", &["get", "Interface", port, "ofport"])
            .await?;
        parse_ofport(&raw).ok_or_else(|| {
            PodnetError::switch("get-ofport", format!("port {port} has no OpenFlow port number ({raw})"))
        })
    }
}

/// `del-flows` specs covering every rule bound to `ofport`.
fn port_flow_specs(ofport: u32) -> [String; 2] {
    [
        format!("table={TAG_TABLE},in_port={ofport}"),
        format!("table={DELIVERY_TABLE},out_port={ofport}"),
    ]
}

/// Parse `ovs-vsctl get Interface <port> ofport` output.
///
/// Unassigned ports report `-1` or `[]`.
fn parse_ofport(raw: &str) -> Option<u32> {
    raw.trim().parse::<u32>().ok().filter(|&n| n > 0)
}
