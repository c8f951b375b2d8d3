//! Reachability checks for bastions and nodes

use crate::session::Connector;
use async_trait::async_trait;
use meshvpn_common::{ConnectionConfig, Error, NodeInfo, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Health of one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub node: String,
    pub host: String,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// Health of a node set, keyed by node name
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub nodes: BTreeMap<String, NodeHealth>,
}

impl HealthReport {
    pub fn healthy(&self) -> usize {
        self.nodes.values().filter(|n| n.reachable).count()
    }

    pub fn unhealthy(&self) -> usize {
        self.nodes.len() - self.healthy()
    }

    pub fn all_healthy(&self) -> bool {
        self.unhealthy() == 0
    }
}

/// Health probes consumed by the mesh manager
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Fail unless the bastion accepts SSH connections
    async fn check_bastion(&self, cancel: &CancellationToken, host: &str, port: u16) -> Result<()>;

    /// Probe every node; one failure never hides the others.
    ///
    /// `base.user` overrides the per-cloud login when set.
    async fn check_multiple_nodes(
        &self,
        cancel: &CancellationToken,
        nodes: &[NodeInfo],
        connector: &dyn Connector,
        base: &ConnectionConfig,
    ) -> HealthReport;
}

/// Default checker: SSH banner probe for bastions, connect + liveness for nodes
#[derive(Debug, Clone)]
pub struct SshHealthChecker {
    timeout: Duration,
}

impl Default for SshHealthChecker {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl SshHealthChecker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HealthChecker for SshHealthChecker {
    async fn check_bastion(&self, cancel: &CancellationToken, host: &str, port: u16) -> Result<()> {
        let bastion_err = |message: String| Error::Bastion {
            host: host.to_string(),
            message,
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(bastion_err("check cancelled".to_string())),
            probe = probe_ssh_banner(host, port, self.timeout) => {
                let latency = probe.map_err(bastion_err)?;
                debug!("Bastion {}:{} answered in {:?}", host, port, latency);
                Ok(())
            }
        }
    }

    async fn check_multiple_nodes(
        &self,
        cancel: &CancellationToken,
        nodes: &[NodeInfo],
        connector: &dyn Connector,
        base: &ConnectionConfig,
    ) -> HealthReport {
        let mut report = HealthReport::default();

        for node in nodes {
            let user = if base.user.is_empty() {
                node.ssh_user().to_string()
            } else {
                base.user.clone()
            };
            let config = base.for_host(node.public_ip.clone(), user);
            let start = Instant::now();

            let health = match connector.connect(cancel, config).await {
                Ok(session) => {
                    let alive = session.is_alive().await;
                    let latency = start.elapsed();
                    if let Err(e) = session.close().await {
                        debug!("Closing health session to {} failed: {}", node.name, e);
                    }
                    NodeHealth {
                        node: node.name.clone(),
                        host: node.public_ip.clone(),
                        reachable: alive,
                        latency_ms: Some(latency.as_millis() as u64),
                        error: (!alive).then(|| "liveness probe failed".to_string()),
                    }
                }
                Err(e) => {
                    warn!("Node {} unhealthy: {}", node.name, e);
                    NodeHealth {
                        node: node.name.clone(),
                        host: node.public_ip.clone(),
                        reachable: false,
                        latency_ms: None,
                        error: Some(e.to_string()),
                    }
                }
            };

            report.nodes.insert(node.name.clone(), health);
        }

        report
    }
}

/// Dial `host:port` and expect an SSH identification banner.
///
/// Returns the round-trip time, or a description of what went wrong.
pub async fn probe_ssh_banner(host: &str, port: u16, timeout: Duration) -> std::result::Result<Duration, String> {
    let start = Instant::now();

    let mut stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| format!("dial {}:{} timed out after {:?}", host, port, timeout))?
        .map_err(|e| format!("dial {}:{} failed: {}", host, port, e))?;

    let mut banner = [0u8; 64];
    let n = tokio::time::timeout(timeout, stream.read(&mut banner))
        .await
        .map_err(|_| format!("no SSH banner from {}:{} within {:?}", host, port, timeout))?
        .map_err(|e| format!("reading banner from {}:{} failed: {}", host, port, e))?;

    if !banner[..n].starts_with(b"SSH-") {
        return Err(format!("{}:{} did not answer with an SSH banner", host, port));
    }

    Ok(start.elapsed())
}
