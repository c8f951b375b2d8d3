//! VPN provider interface and registry
//!
//! Supports:
//! - WireGuard, self-managed through wg-quick files on each node
//! - Headscale/Tailscale, admission through a coordinator API
//!
//! Providers are looked up in an explicit [`ProviderRegistry`] keyed by the
//! `type` tag of their [`ProviderConfig`].

pub mod coordinator;
pub mod wireguard;

pub use coordinator::{CoordinatorProvider, CoordinatorSettings};
pub use wireguard::{WireGuardProvider, WireGuardSettings};

use async_trait::async_trait;
use meshvpn_common::{Error, NodeInfo, PeerChange, PeerConfig, PeerInfo, Result};
use meshvpn_remote::RemoteSession;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

// ============================================================================
// Types
// ============================================================================

/// Provider selection and settings, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    Wireguard(WireGuardSettings),
    Headscale(CoordinatorSettings),
}

impl ProviderConfig {
    /// Registry key
    pub fn tag(&self) -> &'static str {
        match self {
            ProviderConfig::Wireguard(_) => "wireguard",
            ProviderConfig::Headscale(_) => "headscale",
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig::Wireguard(WireGuardSettings::default())
    }
}

/// Per-node input to [`VpnProvider::configure`]
#[derive(Debug, Clone)]
pub struct NodeEnrollment {
    pub node: NodeInfo,
    /// Interface address in CIDR form (self-managed providers)
    pub address: Option<String>,
    /// Interface private key; generated on the node when absent
    pub private_key: Option<String>,
    /// Pre-auth key (coordinator providers)
    pub auth_key: Option<String>,
}

impl NodeEnrollment {
    pub fn new(node: NodeInfo) -> Self {
        Self {
            node,
            address: None,
            private_key: None,
            auth_key: None,
        }
    }
}

/// Provider view of one node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub provider: String,
    pub interface_up: bool,
    pub public_key: Option<String>,
    pub listen_port: Option<u16>,
    /// Interface address as configured, e.g. `10.8.0.1/24`
    pub address: Option<String>,
    pub peer_count: usize,
    pub detail: Option<String>,
}

/// A node a client should peer with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerPeer {
    pub name: String,
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
}

/// Input to [`VpnProvider::generate_client_config`]
#[derive(Debug, Clone)]
pub struct ClientConfigRequest {
    pub label: String,
    pub address: IpAddr,
    /// Left as a placeholder when absent
    pub private_key: Option<String>,
    pub dns: Option<String>,
    pub keepalive: u32,
    pub servers: Vec<ServerPeer>,
}

// ============================================================================
// Provider trait
// ============================================================================

/// VPN strategy applied to cluster nodes
#[async_trait]
pub trait VpnProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether peers are admitted by a central coordinator instead of per node
    fn requires_coordinator(&self) -> bool;

    /// Install the VPN software on a node
    async fn install(&self, session: &dyn RemoteSession) -> Result<()>;

    /// Enroll a node into the mesh
    async fn configure(&self, session: &dyn RemoteSession, enrollment: &NodeEnrollment) -> Result<()>;

    async fn add_peer(&self, session: &dyn RemoteSession, peer: &PeerConfig) -> Result<PeerChange>;

    async fn remove_peer(&self, session: &dyn RemoteSession, public_key: &str) -> Result<PeerChange>;

    /// Admit a peer once through the coordinator, without a node session
    async fn admit_peer(&self, peer: &PeerConfig) -> Result<PeerChange> {
        Err(Error::Provider(format!(
            "{} admits {} per node, not centrally",
            self.name(),
            peer.public_key
        )))
    }

    /// Revoke a peer once through the coordinator
    async fn revoke_peer(&self, public_key: &str) -> Result<PeerChange> {
        Err(Error::Provider(format!(
            "{} revokes {} per node, not centrally",
            self.name(),
            public_key
        )))
    }

    async fn list_peers(&self, session: &dyn RemoteSession) -> Result<Vec<PeerInfo>>;

    async fn get_status(&self, session: &dyn RemoteSession) -> Result<ProviderStatus>;

    async fn is_healthy(&self, session: &dyn RemoteSession) -> bool {
        matches!(self.get_status(session).await, Ok(status) if status.interface_up)
    }

    /// Render what a client needs to join
    fn generate_client_config(&self, request: &ClientConfigRequest) -> Result<String>;
}

// ============================================================================
// Registry
// ============================================================================

type ProviderFactory = Box<dyn Fn(&ProviderConfig) -> Result<Arc<dyn VpnProvider>> + Send + Sync>;

/// Provider constructors keyed by config tag
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ProviderRegistry {
    /// Registry without any providers
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the built-in providers
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("wireguard", |config| match config {
            ProviderConfig::Wireguard(settings) => {
                Ok(Arc::new(WireGuardProvider::new(settings.clone())) as Arc<dyn VpnProvider>)
            }
            other => Err(mismatch("wireguard", other)),
        });
        registry.register("headscale", |config| match config {
            ProviderConfig::Headscale(settings) => {
                Ok(Arc::new(CoordinatorProvider::new(settings.clone())?) as Arc<dyn VpnProvider>)
            }
            other => Err(mismatch("headscale", other)),
        });
        registry
    }

    /// Register or replace a factory
    pub fn register<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn(&ProviderConfig) -> Result<Arc<dyn VpnProvider>> + Send + Sync + 'static,
    {
        self.factories.insert(tag.to_string(), Box::new(factory));
    }

    pub fn tags(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the provider for `config`; WireGuard when unset
    pub fn resolve(&self, config: Option<&ProviderConfig>) -> Result<Arc<dyn VpnProvider>> {
        let default = ProviderConfig::default();
        let config = config.unwrap_or(&default);
        let factory = self.factories.get(config.tag()).ok_or_else(|| {
            Error::Provider(format!(
                "no provider registered for type `{}` (known: {})",
                config.tag(),
                self.tags().join(", ")
            ))
        })?;
        factory(config)
    }
}

fn mismatch(expected: &str, got: &ProviderConfig) -> Error {
    Error::Provider(format!(
        "{} factory cannot build a `{}` provider",
        expected,
        got.tag()
    ))
}
