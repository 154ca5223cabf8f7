//! CLI command definitions and handlers.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use macaddr::MacAddr6;
use podnet_common::{PodnetPaths, SandboxId, Vnid};
use podnet_network::flow::parse_mac;
use podnet_network::{
    AttachmentLedger, AttachmentOrchestrator, CniInvoker, DetachOutcome, FlowController, FlowRuleSet, NetworkCatalog,
    NetworkConfig, NetworkSelector, OvsSwitch, PortStore, RuntimeHost, SwitchPort, TenantEndpoint,
};

use crate::host::DirectoryHost;

/// Podnet - pod network attachment and tenant isolation
#[derive(Parser)]
#[command(name = "podnet")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (defaults to <state>/podnet.toml)
    #[arg(long, global = true, env = "PODNET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// List known networks
    Networks {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Show the networks a pod would be attached to
    Select {
        /// Pod namespace
        namespace: String,
        /// Pod name
        name: String,
    },

    /// Attach a pod sandbox to its networks
    Setup {
        /// Pod namespace
        namespace: String,
        /// Pod name
        name: String,
        /// Sandbox (infra container) ID
        sandbox_id: SandboxId,
    },

    /// Detach a pod sandbox from its networks
    Teardown {
        /// Pod namespace
        namespace: String,
        /// Pod name
        name: String,
        /// Sandbox (infra container) ID
        sandbox_id: SandboxId,
    },

    /// Print a pod's primary IP
    Status {
        /// Pod namespace
        namespace: String,
        /// Pod name
        name: String,
    },

    /// Manage tenant isolation rules
    Flows {
        /// Flow action.
        #[command(subcommand)]
        action: FlowAction,
    },

    /// Manage pod ports on the switch
    Port {
        /// Port action.
        #[command(subcommand)]
        action: PortAction,
    },
}

/// Tenant rule parameters.
#[derive(clap::Args, Clone, Copy)]
pub struct EndpointArgs {
    /// Tenant VNID (decimal or 0x-prefixed hex)
    #[arg(long)]
    pub vnid: Vnid,

    /// Pod MAC address
    #[arg(long, value_parser = parse_mac)]
    pub mac: MacAddr6,

    /// Pod IPv4 address
    #[arg(long)]
    pub ip: Ipv4Addr,
}

impl EndpointArgs {
    const fn endpoint(self) -> TenantEndpoint {
        TenantEndpoint {
            vnid: self.vnid,
            mac: self.mac,
            ip: self.ip,
        }
    }
}

/// Flow subcommands.
#[derive(Subcommand)]
pub enum FlowAction {
    /// Install the three rules of a pod
    Install {
        /// Rule parameters.
        #[command(flatten)]
        endpoint: EndpointArgs,
        /// Switch port name
        #[arg(long)]
        port: String,
        /// OpenFlow port number
        #[arg(long)]
        ofport: u32,
    },

    /// Remove the three rules of a pod
    Remove {
        /// Rule parameters.
        #[command(flatten)]
        endpoint: EndpointArgs,
        /// Switch port name
        #[arg(long)]
        port: String,
        /// OpenFlow port number
        #[arg(long)]
        ofport: u32,
    },
}

/// Port subcommands.
#[derive(Subcommand)]
pub enum PortAction {
    /// Attach a pod's host interface to the switch and isolate it
    Attach {
        /// Pod namespace
        namespace: String,
        /// Pod name
        name: String,
        /// Host-side interface name
        #[arg(long)]
        port: String,
        /// Rule parameters.
        #[command(flatten)]
        endpoint: EndpointArgs,
    },

    /// Remove a pod's rules and detach its port
    Detach {
        /// Pod namespace
        namespace: String,
        /// Pod name
        name: String,
    },

    /// List pods with a recorded switch port
    List,
}

/// Everything a command may need, built once from configuration.
struct Context {
    config: NetworkConfig,
    host: Arc<dyn RuntimeHost>,
    catalog: Arc<NetworkCatalog>,
}

impl Context {
    fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(|| PodnetPaths::new().config_file());
        let config = NetworkConfig::load_or_default(&config_path)?;
        let host: Arc<dyn RuntimeHost> = Arc::new(DirectoryHost::from_paths(&config.paths()));
        let catalog = Arc::new(NetworkCatalog::new(&config));
        Ok(Self {
            config,
            host,
            catalog,
        })
    }

    fn orchestrator(&self) -> AttachmentOrchestrator {
        AttachmentOrchestrator::new(
            Arc::clone(&self.host),
            Arc::new(CniInvoker::from_config(&self.config)),
            Arc::clone(&self.catalog),
            AttachmentLedger::new(self.config.paths().attachments()),
            self.config.plugin_timeout(),
        )
    }

    fn flows(&self) -> FlowController {
        FlowController::new(
            Arc::new(OvsSwitch::from_config(&self.config)),
            PortStore::new(self.config.paths().ports()),
            Arc::clone(&self.host),
        )
    }
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let ctx = Context::load(self.config)?;

        match self.command {
            Commands::Networks { format } => {
                let snapshot = ctx.catalog.refresh().await;
                if format == "json" {
                    let list: Vec<_> = snapshot
                        .networks()
                        .map(|network| {
                            serde_json::json!({
                                "name": network.name,
                                "type": network.plugin_type,
                                "source": network.source,
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&list)?);
                } else {
                    let default = snapshot.default_network().map(|d| d.name.clone());
                    println!("NAME\tTYPE\tSOURCE");
                    for network in snapshot.networks() {
                        let marker = if default.as_deref() == Some(network.name.as_str()) {
                            " (default)"
                        } else {
                            ""
                        };
                        println!(
                            "{}{marker}\t{}\t{}",
                            network.name,
                            network.plugin_type,
                            network.source.display()
                        );
                    }
                }
                Ok(())
            }

            Commands::Select { namespace, name } => {
                let pod = ctx.host.get_pod_by_name(&namespace, &name).await?;
                let selection = NetworkSelector::new(Arc::clone(&ctx.catalog))
                    .select_for(&pod)
                    .await?;
                for network in selection.names() {
                    println!("{network}");
                }
                Ok(())
            }

            Commands::Setup {
                namespace,
                name,
                sandbox_id,
            } => {
                let report = ctx
                    .orchestrator()
                    .set_up_pod(&namespace, &name, &sandbox_id)
                    .await?;
                for outcome in &report.outcomes {
                    let result = outcome.result();
                    let ip = result
                        .primary_ip()
                        .map_or_else(|| "-".to_string(), |ip| ip.to_string());
                    println!("{}\t{ip}", result.network);
                }
                Ok(())
            }

            Commands::Teardown {
                namespace,
                name,
                sandbox_id,
            } => {
                let report = ctx
                    .orchestrator()
                    .tear_down_pod(&namespace, &name, &sandbox_id)
                    .await?;
                for (network, outcome) in &report.outcomes {
                    match outcome {
                        DetachOutcome::Detached => println!("{network}\tdetached"),
                        DetachOutcome::Failed(e) => println!("{network}\tfailed: {e}"),
                    }
                }
                if !report.is_complete() {
                    return Err(eyre!(
                        "Failed to detach {} from: {}",
                        report.pod,
                        report.failed_networks().join(", ")
                    ));
                }
                Ok(())
            }

            Commands::Status { namespace, name } => {
                match ctx.orchestrator().status(&namespace, &name).await? {
                    Some(ip) => println!("{ip}"),
                    None => println!("-"),
                }
                Ok(())
            }

            Commands::Flows { action } => {
                let timeout = ctx.config.switch_timeout();
                let controller = ctx.flows();
                match action {
                    FlowAction::Install {
                        endpoint,
                        port,
                        ofport,
                    } => {
                        let rules = FlowRuleSet::for_endpoint(endpoint.endpoint(), SwitchPort::new(port, ofport));
                        controller.install(&rules, timeout).await?;
                        println!("Installed flows for VNID {} on {}", rules.vnid, rules.port.name);
                    }
                    FlowAction::Remove {
                        endpoint,
                        port,
                        ofport,
                    } => {
                        let rules = FlowRuleSet::for_endpoint(endpoint.endpoint(), SwitchPort::new(port, ofport));
                        controller.remove(&rules, timeout).await?;
                        println!("Removed flows for VNID {} on {}", rules.vnid, rules.port.name);
                    }
                }
                Ok(())
            }

            Commands::Port { action } => {
                let timeout = ctx.config.switch_timeout();
                let controller = ctx.flows();
                match action {
                    PortAction::Attach {
                        namespace,
                        name,
                        port,
                        endpoint,
                    } => {
                        let rules = controller
                            .attach_pod(&namespace, &name, &port, endpoint.endpoint(), timeout)
                            .await?;
                        println!("Port {} attached as ofport {}", rules.port.name, rules.port.ofport);
                    }
                    PortAction::Detach { namespace, name } => {
                        let cleanup = controller.detach_pod(&namespace, &name, timeout).await?;
                        for port in &cleanup.detached {
                            println!("{port}\tdetached");
                        }
                        for port in &cleanup.already_removed {
                            println!("{port}\talready removed");
                        }
                    }
                    PortAction::List => {
                        println!("POD\tPORT\tOFPORT\tVNID\tIP");
                        for record in controller.store().list().await? {
                            let flows = &record.flows;
                            println!(
                                "{}/{}\t{}\t{}\t{}\t{}",
                                record.namespace, record.name, flows.port.name, flows.port.ofport, flows.vnid, flows.ip
                            );
                        }
                    }
                }
                Ok(())
            }
        }
    }
}
