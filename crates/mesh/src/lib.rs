//! meshvpn mesh layer
//!
//! Peer admission across a node set:
//! - `wgconf` / `config_manager`: WireGuard peers on a single node, runtime and on disk
//! - `provider`: pluggable VPN strategies (self-managed WireGuard, Headscale)
//! - `manager`: join/leave fan-out, health, remote commands
//! - `config`: the TOML settings file
//! - `testing`: an in-memory fleet speaking the same command protocol as real nodes

pub mod config;
pub mod config_manager;
pub mod manager;
pub mod provider;
pub mod testing;
pub mod wgconf;

pub use config::MeshSettings;
pub use config_manager::{validate_peer_config, ConfigManager, InterfaceSpec};
pub use manager::{JoinRequest, LeaveRequest, Manager, ManagerSettings, NodeStatus};
pub use provider::{
    ClientConfigRequest, CoordinatorProvider, CoordinatorSettings, NodeEnrollment, ProviderConfig,
    ProviderRegistry, ProviderStatus, ServerPeer, VpnProvider, WireGuardProvider, WireGuardSettings,
};
