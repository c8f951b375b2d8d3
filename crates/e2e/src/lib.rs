//! meshvpn end-to-end scenarios
//!
//! A [`MeshHarness`] wires a settings document, a scratch peer registry and a
//! [`SimulatedFleet`] into a real [`Manager`], the same way `meshctl` does
//! with SSH:
//!
//! ```text
//! settings (TOML) ──► MeshSettings ──► ProviderRegistry::resolve ──► provider
//!                          │                                           │
//!                          └──► ManagerSettings ──► Manager ◄──────────┘
//!                                                     │
//!                                  SimulatedFleet ◄───┴───► PeerRegistry (TempDir)
//! ```

pub mod error;

pub use error::{E2eError, E2eResult};

use meshvpn_common::{NodeInfo, PeerRegistry};
use meshvpn_mesh::testing::{SimulatedFleet, SimulatedHost};
use meshvpn_mesh::{JoinRequest, LeaveRequest, Manager, MeshSettings, ProviderRegistry};
use std::sync::{Arc, Once};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

static TRACING: Once = Once::new();

/// Route scenario logs to the test writer, honouring `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A manager over a simulated fleet and a throwaway registry
pub struct MeshHarness {
    _dir: TempDir,
    pub settings: MeshSettings,
    pub fleet: Arc<SimulatedFleet>,
    pub registry: Arc<PeerRegistry>,
    pub manager: Manager,
    pub cancel: CancellationToken,
}

impl MeshHarness {
    /// `count` provisioned nodes under default settings
    pub fn with_nodes(count: usize) -> E2eResult<Self> {
        Self::build(MeshSettings::default(), |fleet| fleet.add_nodes(count, "aws"))
    }

    /// `count` provisioned nodes under a TOML settings document
    pub fn from_toml(document: &str, count: usize) -> E2eResult<Self> {
        let settings: MeshSettings = toml::from_str(document)?;
        Self::build(settings, |fleet| fleet.add_nodes(count, "aws"))
    }

    /// Nodes with no WireGuard configuration yet
    pub fn with_bare_nodes(count: usize) -> E2eResult<Self> {
        Self::bare_from_toml("", count)
    }

    /// `count` bare nodes under a TOML settings document
    pub fn bare_from_toml(document: &str, count: usize) -> E2eResult<Self> {
        let settings: MeshSettings = toml::from_str(document)?;
        Self::build(settings, |fleet| {
            (1..=count)
                .map(|i| {
                    let address = format!("203.0.113.{}", i);
                    fleet.add_bare_host(&address);
                    NodeInfo::new(format!("bare-{}", i), address, "gcp")
                })
                .collect()
        })
    }

    fn build(
        mut settings: MeshSettings,
        add_nodes: impl FnOnce(&SimulatedFleet) -> Vec<NodeInfo>,
    ) -> E2eResult<Self> {
        init_tracing();

        let dir = TempDir::new()?;
        settings.data_dir = dir.path().join("peers");
        let registry = Arc::new(PeerRegistry::open(&settings.data_dir)?);

        let fleet = SimulatedFleet::new();
        settings.nodes = add_nodes(&fleet);

        let provider = ProviderRegistry::with_defaults().resolve(Some(&settings.provider_config()))?;
        let manager = Manager::new(
            settings.manager_settings(),
            fleet.clone(),
            fleet.clone(),
            provider,
            registry.clone(),
        );

        Ok(Self {
            _dir: dir,
            settings,
            fleet,
            registry,
            manager,
            cancel: CancellationToken::new(),
        })
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.settings.nodes
    }

    /// Simulated host behind a node name
    pub fn host(&self, node: &str) -> E2eResult<Arc<SimulatedHost>> {
        self.settings
            .find_node(node)
            .and_then(|n| self.fleet.host(&n.public_ip))
            .ok_or_else(|| E2eError::UnknownNode(node.to_string()))
    }

    /// Join request for every node with the usual keepalive
    pub fn join_request(&self, public_key: &str, label: &str) -> JoinRequest {
        JoinRequest {
            public_key: public_key.to_string(),
            label: label.to_string(),
            keepalive: 25,
            nodes: self.settings.nodes.clone(),
            ..Default::default()
        }
    }

    pub fn leave_request(&self, public_key: &str) -> LeaveRequest {
        LeaveRequest {
            public_key: Some(public_key.to_string()),
            vpn_ip: None,
            nodes: self.settings.nodes.clone(),
        }
    }

    pub fn stack(&self) -> &str {
        &self.settings.stack
    }
}
