//! # podnet-network
//!
//! Pod network attachment and tenant isolation.
//!
//! This crate attaches pod sandboxes to the virtual networks they belong to
//! by running each network's CNI plugin, and isolates tenants on the node's
//! shared Open vSwitch bridge with cookie-tagged forwarding rules.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use podnet_common::SandboxId;
//! use podnet_network::{
//!     AttachmentLedger, AttachmentOrchestrator, CniInvoker, NetworkCatalog, NetworkConfig, RuntimeHost,
//! };
//!
//! # async fn example(host: Arc<dyn RuntimeHost>) -> podnet_common::PodnetResult<()> {
//! let config = NetworkConfig::default();
//! let orchestrator = AttachmentOrchestrator::new(
//!     host,
//!     Arc::new(CniInvoker::from_config(&config)),
//!     Arc::new(NetworkCatalog::new(&config)),
//!     AttachmentLedger::new(config.paths().attachments()),
//!     config.plugin_timeout(),
//! );
//!
//! let sandbox = SandboxId::new("4f1c2e9a7b3d")?;
//! let report = orchestrator.set_up_pod("tenant-a", "web-0", &sandbox).await?;
//! println!("pod address: {:?}", report.primary_ip);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod catalog;
pub mod command;
pub mod config;
pub mod flow;
pub mod ledger;
pub mod orchestrator;
pub mod plugin;
pub mod pod;
pub mod port_store;
pub mod selector;
pub mod switch;

pub use catalog::{CatalogSnapshot, NetworkCatalog, NetworkDefinition};
pub use config::NetworkConfig;
pub use flow::{FlowController, FlowRule, FlowRuleSet, PortCleanup, SwitchPort, TenantEndpoint};
pub use ledger::AttachmentLedger;
pub use orchestrator::{
    AttachOutcome, AttachmentOrchestrator, AttachmentReport, DetachOutcome, TeardownReport,
};
pub use plugin::{AttachmentResult, CniInvoker, PluginInvoker, RuntimeConf};
pub use pod::{PodIdentity, PodKey, RuntimeHost};
pub use port_store::{PortRecord, PortStore};
pub use selector::{NETWORKS_KEY, NetworkRequest, NetworkSelector, PodNetworkSelection, select};
pub use switch::{OvsSwitch, SwitchControl};
