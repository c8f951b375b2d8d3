//! meshvpn configuration file

use crate::manager::ManagerSettings;
use crate::provider::{NodeEnrollment, ProviderConfig, WireGuardSettings};
use anyhow::Context;
use ipnetwork::IpNetwork;
use meshvpn_common::{BastionConfig, NodeInfo, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings loaded from `config.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSettings {
    /// Registry partition this config operates on
    pub stack: String,

    /// Peer registry directory
    pub data_dir: PathBuf,

    /// SSH private key used for every node
    pub ssh_key_path: PathBuf,

    /// Overrides the per-cloud SSH user
    pub ssh_user: Option<String>,

    pub ssh_port: u16,

    /// Mesh address space
    pub subnet: String,

    /// WireGuard interface used when no provider section is given
    pub interface: String,

    pub dial_timeout_secs: u64,

    pub command_timeout_secs: u64,

    /// Nodes contacted concurrently during a fan-out
    pub parallelism: usize,

    /// Addresses never allocated to peers
    pub reserved_ips: Vec<IpAddr>,

    /// Retry policy for SSH dials
    pub retry: RetryPolicy,

    pub bastion: Option<BastionConfig>,

    pub provider: Option<ProviderConfig>,

    /// Cluster nodes
    pub nodes: Vec<NodeInfo>,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            stack: "default".to_string(),
            data_dir: meshvpn_common::default_registry_path(),
            ssh_key_path: meshvpn_common::default_ssh_key_path(),
            ssh_user: None,
            ssh_port: meshvpn_common::DEFAULT_SSH_PORT,
            subnet: "10.8.0.0/24".to_string(),
            interface: "wg0".to_string(),
            dial_timeout_secs: meshvpn_common::DEFAULT_DIAL_TIMEOUT.as_secs(),
            command_timeout_secs: meshvpn_common::DEFAULT_COMMAND_TIMEOUT.as_secs(),
            parallelism: 1,
            reserved_ips: Vec::new(),
            retry: RetryPolicy::ssh(),
            bastion: None,
            provider: None,
            nodes: Vec::new(),
        }
    }
}

impl MeshSettings {
    /// Load configuration from file, defaults when missing
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let settings: Self =
                toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            Ok(settings)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Provider section, or WireGuard on `interface`
    pub fn provider_config(&self) -> ProviderConfig {
        self.provider.clone().unwrap_or_else(|| {
            ProviderConfig::Wireguard(WireGuardSettings {
                interface: self.interface.clone(),
                ..Default::default()
            })
        })
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            stack: self.stack.clone(),
            subnet: self.subnet.clone(),
            reserved_ips: self.reserved_ips_with_nodes(),
            ssh_user: self.ssh_user.clone(),
            ssh_port: self.ssh_port,
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            bastion: self.bastion.clone(),
            parallelism: self.parallelism.max(1),
        }
    }

    /// Configured reservations plus the addresses bootstrap gives `nodes`
    fn reserved_ips_with_nodes(&self) -> Vec<IpAddr> {
        let mut reserved = self.reserved_ips.clone();
        if !matches!(self.provider_config(), ProviderConfig::Wireguard(_)) {
            return reserved;
        }
        if let Ok(network) = self.subnet.parse::<IpNetwork>() {
            let nodes = (0..self.nodes.len() as u128).map_while(|index| address_from_top(network, index));
            for ip in nodes {
                if !reserved.contains(&ip) {
                    reserved.push(ip);
                }
            }
        }
        reserved
    }

    pub fn find_node(&self, name: &str) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Nodes by name, every node when `names` is empty
    pub fn select_nodes(&self, names: &[String]) -> anyhow::Result<Vec<NodeInfo>> {
        if names.is_empty() {
            return Ok(self.nodes.clone());
        }
        names
            .iter()
            .map(|name| {
                self.find_node(name)
                    .cloned()
                    .with_context(|| format!("node `{}` is not in the config", name))
            })
            .collect()
    }

    /// Bootstrap input for `nodes`.
    ///
    /// Self-managed nodes get interface addresses counted down from the top
    /// of the subnet. [`MeshSettings::manager_settings`] reserves them so peer
    /// allocation skips them. Coordinator nodes get the pre-auth key instead.
    pub fn enrollments(&self, nodes: &[NodeInfo], auth_key: Option<&str>) -> anyhow::Result<Vec<NodeEnrollment>> {
        let network: IpNetwork = self
            .subnet
            .parse()
            .with_context(|| format!("invalid subnet {}", self.subnet))?;
        let self_managed = matches!(self.provider_config(), ProviderConfig::Wireguard(_));

        nodes
            .iter()
            .enumerate()
            .map(|(index, node)| {
                let mut enrollment = NodeEnrollment::new(node.clone());
                if self_managed {
                    let ip = address_from_top(network, index as u128)
                        .with_context(|| format!("subnet {} has no address left for {}", self.subnet, node.name))?;
                    enrollment.address = Some(format!("{}/{}", ip, network.prefix()));
                } else {
                    enrollment.auth_key = auth_key.map(str::to_string);
                }
                Ok(enrollment)
            })
            .collect()
    }
}

/// `index`-th usable address below the top of `network`
fn address_from_top(network: IpNetwork, index: u128) -> Option<IpAddr> {
    let (base, host_bits, max_bits) = match network {
        IpNetwork::V4(n) => (u32::from(n.network()) as u128, 32 - n.prefix() as u32, 32),
        IpNetwork::V6(n) => (u128::from(n.network()), 128 - n.prefix() as u32, 128),
    };
    if host_bits < 2 {
        return None;
    }
    let span = if host_bits == 128 { u128::MAX } else { (1u128 << host_bits) - 1 };
    // Skip the all-ones address
    let candidate = (base | span).checked_sub(1 + index)?;
    // network+1 is the gateway
    if candidate <= base + 1 {
        return None;
    }
    Some(if max_bits == 32 {
        IpAddr::V4(Ipv4Addr::from(candidate as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(candidate))
    })
}
