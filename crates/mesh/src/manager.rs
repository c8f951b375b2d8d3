//! Mesh membership manager
//!
//! Orchestrates joins and leaves across a node set: resolves the peer's VPN
//! address from the registry, checks the bastion once, fans the provider
//! call out to every node with bounded parallelism, aggregates per-node
//! outcomes and finally records the result in the registry. Coordinator
//! providers skip the fan-out and admit the peer once.
//!
//! A fan-out succeeds when at least one node was configured. Nodes that
//! failed are listed in the result; they are not retried or rolled back.

use crate::config_manager::validate_peer_config;
use crate::provider::{ClientConfigRequest, NodeEnrollment, ProviderStatus, ServerPeer, VpnProvider};
use futures::stream::{self, StreamExt};
use ipnetwork::IpNetwork;
use meshvpn_common::{
    BastionConfig, ConnectionConfig, Error, MembershipResult, NodeCommandResult, NodeError, NodeInfo,
    PeerChange, PeerConfig, PeerInfo, PeerRegistry, RegisteredPeer, Result,
};
use meshvpn_remote::{Connector, HealthChecker, HealthReport, RemoteSession};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runtime settings of a [`Manager`]
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Registry partition
    pub stack: String,
    /// Mesh address space, e.g. `10.8.0.0/24`
    pub subnet: String,
    /// Addresses never handed to peers (node interfaces, gateways)
    pub reserved_ips: Vec<IpAddr>,
    /// Overrides the per-cloud SSH user
    pub ssh_user: Option<String>,
    pub ssh_port: u16,
    pub dial_timeout: Duration,
    pub command_timeout: Duration,
    pub bastion: Option<BastionConfig>,
    /// Nodes contacted concurrently during a fan-out
    pub parallelism: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            stack: "default".to_string(),
            subnet: "10.8.0.0/24".to_string(),
            reserved_ips: Vec::new(),
            ssh_user: None,
            ssh_port: meshvpn_common::DEFAULT_SSH_PORT,
            dial_timeout: meshvpn_common::DEFAULT_DIAL_TIMEOUT,
            command_timeout: meshvpn_common::DEFAULT_COMMAND_TIMEOUT,
            bastion: None,
            parallelism: 1,
        }
    }
}

/// Admit a peer to the mesh
#[derive(Debug, Clone, Default)]
pub struct JoinRequest {
    pub public_key: String,
    /// Explicit address; otherwise reused by label or key, else allocated
    pub vpn_ip: Option<IpAddr>,
    pub label: String,
    pub machine_name: String,
    pub endpoint: Option<String>,
    pub keepalive: u32,
    pub preshared_key: Option<String>,
    /// Routed through the peer in addition to its own address
    pub extra_allowed_ips: Vec<String>,
    pub nodes: Vec<NodeInfo>,
}

/// Remove a peer from the mesh, by key or by VPN address
#[derive(Debug, Clone, Default)]
pub struct LeaveRequest {
    pub public_key: Option<String>,
    pub vpn_ip: Option<IpAddr>,
    pub nodes: Vec<NodeInfo>,
}

/// Provider status of one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node: String,
    pub host: String,
    pub status: Option<ProviderStatus>,
    pub error: Option<String>,
}

/// Membership orchestrator
pub struct Manager {
    settings: ManagerSettings,
    connector: Arc<dyn Connector>,
    health: Arc<dyn HealthChecker>,
    provider: Arc<dyn VpnProvider>,
    registry: Arc<PeerRegistry>,
}

impl Manager {
    pub fn new(
        settings: ManagerSettings,
        connector: Arc<dyn Connector>,
        health: Arc<dyn HealthChecker>,
        provider: Arc<dyn VpnProvider>,
        registry: Arc<PeerRegistry>,
    ) -> Self {
        Self {
            settings,
            connector,
            health,
            provider,
            registry,
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn provider(&self) -> &dyn VpnProvider {
        self.provider.as_ref()
    }

    /// Connection parameters shared by every node
    pub fn base_connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: String::new(),
            user: String::new(),
            port: self.settings.ssh_port,
            dial_timeout: self.settings.dial_timeout,
            command_timeout: self.settings.command_timeout,
            bastion: self.settings.bastion.clone(),
        }
    }

    fn connection_for(&self, node: &NodeInfo) -> ConnectionConfig {
        let user = self
            .settings
            .ssh_user
            .clone()
            .unwrap_or_else(|| node.ssh_user().to_string());
        self.base_connection().for_host(node.public_ip.clone(), user)
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Admit a peer on every node and record it in the registry
    pub async fn join(&self, cancel: &CancellationToken, request: JoinRequest) -> Result<MembershipResult> {
        let stack = &self.settings.stack;
        if request.nodes.is_empty() {
            return Err(Error::InvalidConfig("join needs at least one node".to_string()));
        }

        let vpn_ip = self.resolve_join_ip(&request)?;
        let mut allowed_ips = vec![host_cidr(vpn_ip)];
        allowed_ips.extend(request.extra_allowed_ips.iter().cloned());

        let peer = PeerConfig {
            public_key: request.public_key.clone(),
            allowed_ips,
            endpoint: request.endpoint.clone(),
            keepalive: request.keepalive,
            label: request.label.clone(),
            preshared_key: request.preshared_key.clone(),
        };
        validate_peer_config(&peer)?;

        let provider = &self.provider;
        let coordinator = self.coordinator_node();
        let outcomes = if provider.requires_coordinator() {
            info!("Admitting peer {} ({}) at {} through the coordinator", peer.public_key, peer.label, vpn_ip);
            vec![(&coordinator, provider.admit_peer(&peer).await)]
        } else {
            self.check_bastion(cancel).await?;
            info!(
                "Joining peer {} ({}) at {} on {} nodes",
                peer.public_key,
                peer.label,
                vpn_ip,
                request.nodes.len()
            );

            let peer_ref = &peer;
            self.fan_out(&request.nodes, |node| {
                self.with_session(cancel, node, move |session| async move {
                    provider.add_peer(session.as_ref(), peer_ref).await
                })
            })
            .await
        };

        let mut result = MembershipResult {
            public_key: peer.public_key.clone(),
            vpn_ip: Some(vpn_ip),
            ..Default::default()
        };
        aggregate(&mut result, outcomes, "join");

        let mut record = RegisteredPeer::new(&peer.public_key, vpn_ip);
        record.label = request.label.clone();
        record.machine_name = request.machine_name.clone();
        record.endpoint = request.endpoint.clone();
        record.allowed_ips = peer.allowed_ips.clone();
        match self.registry.register(stack, record) {
            Ok(_) => result.registry_updated = true,
            Err(e) => {
                error!("Failed to record peer {} in registry: {}", peer.public_key, e);
                result.errors.push(NodeError {
                    node: "registry".to_string(),
                    message: e.to_string(),
                });
            }
        }

        finish("join", result)
    }

    /// Remove a registered peer from every node and from the registry
    pub async fn leave(&self, cancel: &CancellationToken, request: LeaveRequest) -> Result<MembershipResult> {
        let stack = &self.settings.stack;
        if request.nodes.is_empty() {
            return Err(Error::InvalidConfig("leave needs at least one node".to_string()));
        }

        let registered = self.resolve_leave_peer(&request)?;

        let provider = &self.provider;
        let key = registered.public_key.as_str();
        let coordinator = self.coordinator_node();
        let outcomes = if provider.requires_coordinator() {
            info!("Revoking peer {} ({}) through the coordinator", key, registered.vpn_ip);
            vec![(&coordinator, provider.revoke_peer(key).await)]
        } else {
            self.check_bastion(cancel).await?;
            info!(
                "Removing peer {} ({}) from {} nodes",
                key,
                registered.vpn_ip,
                request.nodes.len()
            );

            self.fan_out(&request.nodes, |node| {
                self.with_session(cancel, node, move |session| async move {
                    provider.remove_peer(session.as_ref(), key).await
                })
            })
            .await
        };

        let mut result = MembershipResult {
            public_key: registered.public_key.clone(),
            vpn_ip: Some(registered.vpn_ip),
            ..Default::default()
        };
        aggregate(&mut result, outcomes, "leave");

        match self.registry.unregister(stack, &registered.public_key) {
            Ok(_) => result.registry_updated = true,
            Err(e) => {
                error!("Failed to drop peer {} from registry: {}", registered.public_key, e);
                result.errors.push(NodeError {
                    node: "registry".to_string(),
                    message: e.to_string(),
                });
            }
        }

        finish("leave", result)
    }

    /// Outcome owner for central admissions
    fn coordinator_node(&self) -> NodeInfo {
        NodeInfo::new("coordinator", "", self.provider.name())
    }

    fn resolve_join_ip(&self, request: &JoinRequest) -> Result<IpAddr> {
        let stack = &self.settings.stack;

        if let Some(ip) = request.vpn_ip {
            return Ok(ip);
        }

        if !request.label.is_empty() {
            match self.registry.get_by_label(stack, &request.label) {
                Ok(existing) => {
                    debug!("Reusing {} of label {}", existing.vpn_ip, request.label);
                    return Ok(existing.vpn_ip);
                }
                Err(Error::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(existing) = self.registry.get(stack, &request.public_key)? {
            debug!("Reusing {} of key {}", existing.vpn_ip, request.public_key);
            return Ok(existing.vpn_ip);
        }

        self.registry
            .next_available_ip(stack, &self.settings.subnet, &self.settings.reserved_ips)
    }

    fn resolve_leave_peer(&self, request: &LeaveRequest) -> Result<RegisteredPeer> {
        let stack = &self.settings.stack;

        if let Some(key) = &request.public_key {
            if let Some(peer) = self.registry.get(stack, key)? {
                return Ok(peer);
            }
        }

        if let Some(ip) = request.vpn_ip {
            match self.registry.get_by_ip(stack, ip) {
                Ok(peer) => return Ok(peer),
                Err(Error::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let wanted = match (&request.public_key, request.vpn_ip) {
            (Some(key), _) => key.clone(),
            (None, Some(ip)) => ip.to_string(),
            (None, None) => "<no key or address given>".to_string(),
        };
        Err(Error::PeerNotFound(wanted))
    }

    // ========================================================================
    // Health and remote commands
    // ========================================================================

    /// Fail early when the configured bastion is unreachable
    pub async fn check_bastion(&self, cancel: &CancellationToken) -> Result<()> {
        match &self.settings.bastion {
            Some(bastion) => {
                let port = if bastion.port == 0 {
                    meshvpn_common::DEFAULT_SSH_PORT
                } else {
                    bastion.port
                };
                self.health.check_bastion(cancel, &bastion.host, port).await
            }
            None => Ok(()),
        }
    }

    /// Reachability of every node
    pub async fn check_health(&self, cancel: &CancellationToken, nodes: &[NodeInfo]) -> Result<HealthReport> {
        self.check_bastion(cancel).await?;
        let mut base = self.base_connection();
        if let Some(user) = &self.settings.ssh_user {
            base.user = user.clone();
        }
        Ok(self
            .health
            .check_multiple_nodes(cancel, nodes, self.connector.as_ref(), &base)
            .await)
    }

    /// Run a command on one node
    pub async fn execute_on_node(&self, cancel: &CancellationToken, node: &NodeInfo, command: &str) -> Result<String> {
        self.with_session(cancel, node, |session| async move { session.execute(command).await })
            .await
    }

    /// Run a command on every node; results keyed by node name
    pub async fn execute_on_all_nodes(
        &self,
        cancel: &CancellationToken,
        nodes: &[NodeInfo],
        command: &str,
    ) -> Result<BTreeMap<String, NodeCommandResult>> {
        self.check_bastion(cancel).await?;
        let outcomes = self
            .fan_out(nodes, |node| self.execute_on_node(cancel, node, command))
            .await;
        Ok(command_results(outcomes))
    }

    // ========================================================================
    // Provisioning and inspection
    // ========================================================================

    /// Install and enroll the provider on every node
    pub async fn bootstrap(
        &self,
        cancel: &CancellationToken,
        enrollments: &[NodeEnrollment],
    ) -> Result<BTreeMap<String, NodeCommandResult>> {
        self.check_bastion(cancel).await?;
        let nodes: Vec<NodeInfo> = enrollments.iter().map(|e| e.node.clone()).collect();
        let provider = &self.provider;

        let outcomes = self
            .fan_out(&nodes, |node| {
                let enrollment = enrollments.iter().find(|e| e.node.name == node.name);
                self.with_session(cancel, node, move |session| async move {
                    let enrollment = enrollment
                        .ok_or_else(|| Error::Internal(format!("no enrollment for {}", session.host())))?;
                    provider.install(session.as_ref()).await?;
                    provider.configure(session.as_ref(), enrollment).await?;
                    Ok::<_, Error>(format!("{} ready", provider.name()))
                })
            })
            .await;

        Ok(command_results(outcomes))
    }

    /// Provider status of every node
    pub async fn mesh_status(&self, cancel: &CancellationToken, nodes: &[NodeInfo]) -> Result<Vec<NodeStatus>> {
        self.check_bastion(cancel).await?;
        let provider = &self.provider;
        let outcomes = self
            .fan_out(nodes, |node| {
                self.with_session(cancel, node, move |session| async move {
                    provider.get_status(session.as_ref()).await
                })
            })
            .await;

        Ok(outcomes
            .into_iter()
            .map(|(node, outcome)| NodeStatus {
                node: node.name.clone(),
                host: node.public_ip.clone(),
                error: outcome.as_ref().err().map(|e| e.to_string()),
                status: outcome.ok(),
            })
            .collect())
    }

    /// Live peers on one node
    pub async fn node_peers(&self, cancel: &CancellationToken, node: &NodeInfo) -> Result<Vec<PeerInfo>> {
        self.check_bastion(cancel).await?;
        let provider = &self.provider;
        self.with_session(cancel, node, move |session| async move {
            provider.list_peers(session.as_ref()).await
        })
        .await
    }

    /// Client configuration for a registered peer.
    ///
    /// Server entries are built from the live status of each node; nodes that
    /// cannot be inspected are left out.
    pub async fn client_config(
        &self,
        cancel: &CancellationToken,
        public_key: &str,
        private_key: Option<String>,
        dns: Option<String>,
        nodes: &[NodeInfo],
    ) -> Result<String> {
        let peer = self
            .registry
            .get(&self.settings.stack, public_key)?
            .ok_or_else(|| Error::PeerNotFound(public_key.to_string()))?;

        let mut servers = Vec::new();
        if !self.provider.requires_coordinator() {
            for status in self.mesh_status(cancel, nodes).await? {
                match status.status {
                    Some(ProviderStatus {
                        public_key: Some(key),
                        address: Some(address),
                        listen_port,
                        ..
                    }) => {
                        let address = address.split('/').next().unwrap_or_default();
                        let allowed = match address.parse::<IpAddr>() {
                            Ok(ip) => host_cidr(ip),
                            Err(_) => continue,
                        };
                        servers.push(ServerPeer {
                            name: status.node.clone(),
                            public_key: key,
                            endpoint: listen_port.map(|p| format!("{}:{}", status.host, p)),
                            allowed_ips: vec![allowed],
                        });
                    }
                    _ => warn!(
                        "Skipping {} in client config: {}",
                        status.node,
                        status.error.unwrap_or_else(|| "interface not ready".to_string())
                    ),
                }
            }
            if let Some(first) = servers.first_mut() {
                first.allowed_ips.push(self.settings.subnet.clone());
            }
        }

        self.provider.generate_client_config(&ClientConfigRequest {
            label: if peer.label.is_empty() {
                peer.public_key.clone()
            } else {
                peer.label.clone()
            },
            address: peer.vpn_ip,
            private_key,
            dns,
            keepalive: 25,
            servers,
        })
    }

    // ========================================================================
    // Fan-out plumbing
    // ========================================================================

    /// Run `op` for every node, at most `parallelism` at a time, in node order
    async fn fan_out<'a, T, F, Fut>(&self, nodes: &'a [NodeInfo], op: F) -> Vec<(&'a NodeInfo, T)>
    where
        F: Fn(&'a NodeInfo) -> Fut,
        Fut: Future<Output = T>,
    {
        stream::iter(nodes.iter().map(|node| {
            let fut = op(node);
            async move { (node, fut.await) }
        }))
        .buffered(self.settings.parallelism.max(1))
        .collect()
        .await
    }

    /// Connect, run `op`, always close
    async fn with_session<T, F, Fut>(&self, cancel: &CancellationToken, node: &NodeInfo, op: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn RemoteSession>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = self.connector.connect(cancel, self.connection_for(node)).await?;
        let result = op(session.clone()).await;
        if let Err(e) = session.close().await {
            debug!("Closing session to {} failed: {}", node.name, e);
        }
        result
    }
}

fn host_cidr(ip: IpAddr) -> String {
    let prefix = match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    IpNetwork::new(ip, prefix)
        .map(|n| n.to_string())
        .unwrap_or_else(|_| ip.to_string())
}

fn aggregate(result: &mut MembershipResult, outcomes: Vec<(&NodeInfo, Result<PeerChange>)>, operation: &str) {
    for (node, outcome) in outcomes {
        match outcome {
            Ok(change) => {
                result.nodes_configured += 1;
                if !change.is_reboot_safe() {
                    result.warnings.push(NodeError {
                        node: node.name.clone(),
                        message: format!(
                            "applied at runtime but not persisted: {}",
                            change.persist_error.unwrap_or_else(|| "unknown error".to_string())
                        ),
                    });
                }
            }
            Err(e) => {
                warn!("{} failed on {}: {}", operation, node.name, e);
                result.nodes_failed += 1;
                result.errors.push(NodeError {
                    node: node.name.clone(),
                    message: e.to_string(),
                });
            }
        }
    }
}

fn finish(operation: &'static str, result: MembershipResult) -> Result<MembershipResult> {
    if result.nodes_configured > 0 {
        info!(
            "{} of {}: {}/{} nodes configured",
            operation,
            result.public_key,
            result.nodes_configured,
            result.attempted()
        );
        Ok(result)
    } else {
        Err(Error::AllNodesFailed {
            operation,
            attempted: result.attempted(),
            result: Box::new(result),
        })
    }
}

fn command_results(outcomes: Vec<(&NodeInfo, Result<String>)>) -> BTreeMap<String, NodeCommandResult> {
    outcomes
        .into_iter()
        .map(|(node, outcome)| {
            let (output, error) = match outcome {
                Ok(output) => (Some(output), None),
                Err(e) => (None, Some(e.to_string())),
            };
            (
                node.name.clone(),
                NodeCommandResult {
                    node: node.name.clone(),
                    output,
                    error,
                },
            )
        })
        .collect()
}
