//! Node commands: health, status, remote execution, bootstrap

use anyhow::Result;
use clap::Subcommand;
use meshvpn_common::{NodeCommandResult, PeerInfo};
use meshvpn_mesh::NodeStatus;
use meshvpn_remote::NodeHealth;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use crate::context::MeshContext;
use crate::output::{print_error, print_list, print_success, print_warning, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum NodeCommands {
    /// List configured nodes
    List,

    /// Probe SSH reachability of the nodes
    Health {
        #[arg(long = "node")]
        nodes: Vec<String>,
    },

    /// VPN status reported by each node
    Status {
        #[arg(long = "node")]
        nodes: Vec<String>,
    },

    /// Live peers of one node
    Peers {
        node: String,
    },

    /// Run a shell command on the nodes
    Exec {
        command: String,

        #[arg(long = "node")]
        nodes: Vec<String>,
    },

    /// Install and enroll the VPN provider on the nodes
    Bootstrap {
        /// Pre-auth key for coordinator providers
        #[arg(long, env = "MESHVPN_AUTH_KEY", hide_env_values = true)]
        auth_key: Option<String>,

        #[arg(long = "node")]
        nodes: Vec<String>,
    },
}

#[derive(Serialize)]
pub struct NodeDisplay {
    pub name: String,
    pub public_ip: String,
    pub provider: String,
    pub ssh_user: String,
}

impl TableDisplay for NodeDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Name", "Public IP", "Cloud", "SSH User"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.public_ip.clone(),
            self.provider.clone(),
            self.ssh_user.clone(),
        ]
    }
}

#[derive(Serialize)]
pub struct HealthDisplay {
    pub node: String,
    pub host: String,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub error: String,
}

impl From<NodeHealth> for HealthDisplay {
    fn from(health: NodeHealth) -> Self {
        Self {
            node: health.node,
            host: health.host,
            reachable: health.reachable,
            latency_ms: health.latency_ms,
            error: health.error.unwrap_or_default(),
        }
    }
}

impl TableDisplay for HealthDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Node", "Host", "Reachable", "Latency", "Error"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.node.clone(),
            self.host.clone(),
            if self.reachable { "yes" } else { "no" }.to_string(),
            self.latency_ms.map(|ms| format!("{} ms", ms)).unwrap_or_else(|| "-".to_string()),
            self.error.clone(),
        ]
    }
}

#[derive(Serialize)]
pub struct StatusDisplay {
    pub node: String,
    pub provider: String,
    pub interface: String,
    pub address: String,
    pub listen_port: String,
    pub peers: String,
    pub public_key: String,
}

impl From<NodeStatus> for StatusDisplay {
    fn from(status: NodeStatus) -> Self {
        match (status.status, status.error) {
            (Some(s), _) => Self {
                node: status.node,
                provider: s.provider,
                interface: if s.interface_up { "up" } else { "down" }.to_string(),
                address: s.address.unwrap_or_default(),
                listen_port: s.listen_port.map(|p| p.to_string()).unwrap_or_default(),
                peers: s.peer_count.to_string(),
                public_key: s.public_key.unwrap_or_default(),
            },
            (None, error) => Self {
                node: status.node,
                provider: String::new(),
                interface: format!("error: {}", error.unwrap_or_default()),
                address: String::new(),
                listen_port: String::new(),
                peers: String::new(),
                public_key: String::new(),
            },
        }
    }
}

impl TableDisplay for StatusDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Node", "Provider", "Interface", "Address", "Port", "Peers", "Public Key"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.node.clone(),
            self.provider.clone(),
            self.interface.clone(),
            self.address.clone(),
            self.listen_port.clone(),
            self.peers.clone(),
            self.public_key.clone(),
        ]
    }
}

#[derive(Serialize)]
pub struct LivePeerDisplay {
    pub public_key: String,
    pub endpoint: String,
    pub allowed_ips: String,
    pub handshake: String,
    pub transfer: String,
}

impl From<PeerInfo> for LivePeerDisplay {
    fn from(peer: PeerInfo) -> Self {
        let handshake = peer
            .latest_handshake
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        Self {
            public_key: peer.public_key,
            endpoint: peer.endpoint.unwrap_or_default(),
            allowed_ips: peer.allowed_ips.join(", "),
            handshake,
            transfer: format!("{} rx / {} tx", peer.transfer_rx, peer.transfer_tx),
        }
    }
}

impl TableDisplay for LivePeerDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Public Key", "Endpoint", "Allowed IPs", "Handshake", "Transfer"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.public_key.clone(),
            self.endpoint.clone(),
            self.allowed_ips.clone(),
            self.handshake.clone(),
            self.transfer.clone(),
        ]
    }
}

/// Print per-node command outcomes; fails when any node failed
fn report_commands(results: BTreeMap<String, NodeCommandResult>, format: OutputFormat) -> Result<()> {
    let failed = results.values().filter(|r| !r.ok()).count();
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        for (node, result) in &results {
            match (&result.output, &result.error) {
                (_, Some(error)) => print_error(&format!("{}: {}", node, error)),
                (Some(output), None) => {
                    println!("=== {} ===", node);
                    println!("{}", output.trim_end());
                }
                (None, None) => print_success(node),
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} nodes failed", failed, results.len());
    }
    Ok(())
}

pub async fn execute(
    ctx: &MeshContext,
    cmd: NodeCommands,
    cancel: &CancellationToken,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        NodeCommands::List => {
            let ssh_override = ctx.settings().ssh_user.clone();
            let nodes: Vec<NodeDisplay> = ctx
                .settings()
                .nodes
                .iter()
                .map(|n| NodeDisplay {
                    name: n.name.clone(),
                    public_ip: n.public_ip.clone(),
                    provider: n.provider.clone(),
                    ssh_user: ssh_override.clone().unwrap_or_else(|| n.ssh_user().to_string()),
                })
                .collect();
            print_list(&nodes, format);
        }

        NodeCommands::Health { nodes } => {
            let nodes = ctx.settings().select_nodes(&nodes)?;
            let report = ctx.manager().await?.check_health(cancel, &nodes).await?;
            let (healthy, total) = (report.healthy(), report.nodes.len());
            let rows: Vec<HealthDisplay> = report.nodes.into_values().map(HealthDisplay::from).collect();
            print_list(&rows, format);
            if format != OutputFormat::Json {
                if healthy == total {
                    print_success(&format!("{}/{} nodes healthy", healthy, total));
                } else {
                    print_warning(&format!("{}/{} nodes healthy", healthy, total));
                }
            }
        }

        NodeCommands::Status { nodes } => {
            let nodes = ctx.settings().select_nodes(&nodes)?;
            let statuses = ctx.manager().await?.mesh_status(cancel, &nodes).await?;
            let rows: Vec<StatusDisplay> = statuses.into_iter().map(StatusDisplay::from).collect();
            print_list(&rows, format);
        }

        NodeCommands::Peers { node } => {
            let node = ctx.settings().select_nodes(&[node])?.remove(0);
            let peers = ctx.manager().await?.node_peers(cancel, &node).await?;
            let rows: Vec<LivePeerDisplay> = peers.into_iter().map(LivePeerDisplay::from).collect();
            print_list(&rows, format);
        }

        NodeCommands::Exec { command, nodes } => {
            let nodes = ctx.settings().select_nodes(&nodes)?;
            let results = ctx
                .manager()
                .await?
                .execute_on_all_nodes(cancel, &nodes, &command)
                .await?;
            report_commands(results, format)?;
        }

        NodeCommands::Bootstrap { auth_key, nodes } => {
            let nodes = ctx.settings().select_nodes(&nodes)?;
            let enrollments = ctx.settings().enrollments(&nodes, auth_key.as_deref())?;
            let results = ctx.manager().await?.bootstrap(cancel, &enrollments).await?;
            report_commands(results, format)?;
        }
    }

    Ok(())
}
