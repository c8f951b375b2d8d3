//! Core types for meshvpn

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Length of a base64-encoded WireGuard key
pub const WG_KEY_LEN: usize = 44;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default SSH user when nothing else applies
pub const DEFAULT_SSH_USER: &str = "root";

/// Default dial timeout
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for a single remote command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

// ============================================================================
// Nodes and connections
// ============================================================================

/// Cluster node descriptor supplied by the provisioning layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub public_ip: String,
    /// Cloud provider tag (aws, gcp, azure, ...)
    #[serde(default)]
    pub provider: String,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>, public_ip: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            public_ip: public_ip.into(),
            provider: provider.into(),
        }
    }

    /// SSH login for this node's cloud image
    pub fn ssh_user(&self) -> &'static str {
        ssh_user_for_provider(&self.provider)
    }
}

/// Default login user of the stock images each cloud ships
pub fn ssh_user_for_provider(provider: &str) -> &'static str {
    match provider.to_ascii_lowercase().as_str() {
        "aws" => "ubuntu",
        "gcp" => "ubuntu",
        "azure" => "azureuser",
        _ => DEFAULT_SSH_USER,
    }
}

/// Bastion host used for double-hop SSH
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BastionConfig {
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub port: u16,
}

impl BastionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: String::new(),
            port: 0,
        }
    }

    fn with_defaults(mut self) -> Self {
        if self.user.is_empty() {
            self.user = DEFAULT_SSH_USER.to_string();
        }
        if self.port == 0 {
            self.port = DEFAULT_SSH_PORT;
        }
        self
    }
}

/// Parameters for one SSH connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub dial_timeout: Duration,
    pub command_timeout: Duration,
    pub bastion: Option<BastionConfig>,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: String::new(),
            port: 0,
            dial_timeout: Duration::ZERO,
            command_timeout: Duration::ZERO,
            bastion: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bastion(mut self, bastion: Option<BastionConfig>) -> Self {
        self.bastion = bastion;
        self
    }

    /// Fill unset fields: user=root, port=22, dial timeout=30s
    pub fn with_defaults(mut self) -> Self {
        if self.user.is_empty() {
            self.user = DEFAULT_SSH_USER.to_string();
        }
        if self.port == 0 {
            self.port = DEFAULT_SSH_PORT;
        }
        if self.dial_timeout.is_zero() {
            self.dial_timeout = DEFAULT_DIAL_TIMEOUT;
        }
        if self.command_timeout.is_zero() {
            self.command_timeout = DEFAULT_COMMAND_TIMEOUT;
        }
        self.bastion = self.bastion.map(BastionConfig::with_defaults);
        self
    }

    /// Same settings, pointed at another host
    pub fn for_host(&self, host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            ..self.clone()
        }
    }
}

/// SSH hop a connectivity error happened on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hop {
    Bastion,
    Target,
}

impl std::fmt::Display for Hop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Hop::Bastion => write!(f, "bastion"),
            Hop::Target => write!(f, "target"),
        }
    }
}

// ============================================================================
// Peers
// ============================================================================

/// Peer mutation input, validated before any remote call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub public_key: String,
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Persistent keepalive in seconds, 0 disables
    #[serde(default)]
    pub keepalive: u32,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub preshared_key: Option<String>,
}

impl PeerConfig {
    pub fn new(public_key: impl Into<String>, allowed_ips: Vec<String>) -> Self {
        Self {
            public_key: public_key.into(),
            allowed_ips,
            endpoint: None,
            keepalive: 0,
            label: String::new(),
            preshared_key: None,
        }
    }
}

/// Durable registry record of an admitted peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredPeer {
    pub public_key: String,
    pub vpn_ip: IpAddr,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub machine_name: String,
    pub added_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

impl RegisteredPeer {
    pub fn new(public_key: impl Into<String>, vpn_ip: IpAddr) -> Self {
        let now = Utc::now();
        Self {
            public_key: public_key.into(),
            vpn_ip,
            label: String::new(),
            machine_name: String::new(),
            added_at: now,
            last_seen: now,
            endpoint: None,
            allowed_ips: Vec::new(),
        }
    }
}

/// Live peer state as reported by `wg show <if> dump`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    /// Unix seconds, None if the peer never completed a handshake
    pub latest_handshake: Option<i64>,
    pub transfer_rx: u64,
    pub transfer_tx: u64,
    pub persistent_keepalive: Option<u32>,
}

/// Outcome of a single-node peer mutation
///
/// A change can reach the running interface without reaching the config file;
/// such a node is live-correct but will lose the peer on reboot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerChange {
    pub runtime_applied: bool,
    pub persisted: bool,
    /// Runtime already matched the requested state
    pub already_present: bool,
    pub persist_error: Option<String>,
}

impl PeerChange {
    pub fn is_reboot_safe(&self) -> bool {
        self.persisted
    }
}

// ============================================================================
// Fan-out results
// ============================================================================

/// Per-node failure captured during a fan-out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub node: String,
    pub message: String,
}

/// Result of a join or leave across a node set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipResult {
    pub public_key: String,
    pub vpn_ip: Option<IpAddr>,
    pub nodes_configured: usize,
    pub nodes_failed: usize,
    pub errors: Vec<NodeError>,
    /// Non-fatal issues, e.g. nodes updated at runtime only
    pub warnings: Vec<NodeError>,
    pub registry_updated: bool,
}

impl MembershipResult {
    pub fn attempted(&self) -> usize {
        self.nodes_configured + self.nodes_failed
    }

    pub fn is_complete(&self) -> bool {
        self.nodes_failed == 0 && self.registry_updated
    }
}

/// Output or error of one node in a command fan-out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCommandResult {
    pub node: String,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl NodeCommandResult {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}
