//! Headscale/Tailscale provider
//!
//! Nodes run `tailscaled` joined to a Headscale coordinator. Peers are
//! admitted once, centrally, through the coordinator's HTTP API; node
//! sessions are only used for install, enrollment and status.

use super::{ClientConfigRequest, NodeEnrollment, ProviderStatus, VpnProvider};
use crate::config_manager::validate_peer_config;
use async_trait::async_trait;
use chrono::DateTime;
use meshvpn_common::{Error, PeerChange, PeerConfig, PeerInfo, Result};
use meshvpn_remote::{shell_quote, RemoteSession};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const INSTALL_SCRIPT: &str = r#"
if command -v tailscale >/dev/null 2>&1; then
  exit 0
fi
curl -fsSL https://tailscale.com/install.sh | sh
sudo systemctl enable --now tailscaled
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Base URL of the coordinator, e.g. `https://headscale.example.com`
    pub server_url: String,
    /// Bearer token for the admission API
    pub api_key: String,
    /// Coordinator user/namespace peers are admitted under
    pub user: Option<String>,
    /// Pre-auth key used to enroll nodes
    pub auth_key: Option<String>,
    pub tags: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            api_key: String::new(),
            user: None,
            auth_key: None,
            tags: Vec::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Serialize)]
struct AdmissionRequest<'a> {
    public_key: &'a str,
    allowed_ips: &'a [String],
    label: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    tags: &'a [String],
}

/// Subset of `tailscale status --json`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TailscaleStatus {
    #[serde(default)]
    backend_state: String,
    #[serde(rename = "Self")]
    self_node: Option<TailscalePeer>,
    #[serde(default)]
    peer: HashMap<String, TailscalePeer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TailscalePeer {
    #[serde(default)]
    public_key: String,
    #[serde(rename = "TailscaleIPs", default)]
    tailscale_ips: Vec<String>,
    #[serde(default)]
    cur_addr: String,
    #[serde(default)]
    rx_bytes: u64,
    #[serde(default)]
    tx_bytes: u64,
    #[serde(default)]
    last_handshake: Option<String>,
}

impl From<&TailscalePeer> for PeerInfo {
    fn from(peer: &TailscalePeer) -> Self {
        let latest_handshake = peer
            .last_handshake
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.timestamp())
            .filter(|t| *t > 0);
        Self {
            public_key: peer.public_key.clone(),
            endpoint: (!peer.cur_addr.is_empty()).then(|| peer.cur_addr.clone()),
            allowed_ips: peer.tailscale_ips.clone(),
            latest_handshake,
            transfer_rx: peer.rx_bytes,
            transfer_tx: peer.tx_bytes,
            persistent_keepalive: None,
        }
    }
}

/// Coordinator-backed provider
#[derive(Debug, Clone)]
pub struct CoordinatorProvider {
    settings: CoordinatorSettings,
    http: reqwest::Client,
}

impl CoordinatorProvider {
    pub fn new(settings: CoordinatorSettings) -> Result<Self> {
        if !settings.server_url.starts_with("http://") && !settings.server_url.starts_with("https://") {
            return Err(Error::InvalidConfig(format!(
                "coordinator server_url `{}` must be an http(s) URL",
                settings.server_url
            )));
        }
        if settings.api_key.is_empty() {
            return Err(Error::InvalidConfig("coordinator api_key is empty".to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::Coordinator(format!("HTTP client: {}", e)))?;

        Ok(Self { settings, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.server_url.trim_end_matches('/'), path)
    }

    async fn status(&self, session: &dyn RemoteSession) -> Result<TailscaleStatus> {
        let output = session.execute("sudo tailscale status --json").await?;
        Ok(serde_json::from_str(&output)?)
    }
}

#[async_trait]
impl VpnProvider for CoordinatorProvider {
    fn name(&self) -> &str {
        "headscale"
    }

    fn requires_coordinator(&self) -> bool {
        true
    }

    async fn install(&self, session: &dyn RemoteSession) -> Result<()> {
        session.execute_script(INSTALL_SCRIPT).await?;
        info!("tailscaled present on {}", session.host());
        Ok(())
    }

    async fn configure(&self, session: &dyn RemoteSession, enrollment: &NodeEnrollment) -> Result<()> {
        let auth_key = enrollment
            .auth_key
            .as_ref()
            .or(self.settings.auth_key.as_ref())
            .ok_or_else(|| {
                Error::Provider(format!(
                    "node {} needs a pre-auth key to enroll",
                    enrollment.node.name
                ))
            })?;

        let mut command = format!(
            "sudo tailscale up --reset --login-server {} --authkey {} --hostname {}",
            shell_quote(&self.settings.server_url),
            shell_quote(auth_key),
            shell_quote(&enrollment.node.name)
        );
        if !self.settings.tags.is_empty() {
            let tags: Vec<String> = self.settings.tags.iter().map(|t| format!("tag:{}", t)).collect();
            command.push_str(&format!(" --advertise-tags {}", shell_quote(&tags.join(","))));
        }

        session.execute(&command).await?;
        info!("Enrolled {} with coordinator {}", enrollment.node.name, self.settings.server_url);
        Ok(())
    }

    async fn add_peer(&self, session: &dyn RemoteSession, peer: &PeerConfig) -> Result<PeerChange> {
        debug!("Admitting {} centrally, not on {}", peer.public_key, session.host());
        self.admit_peer(peer).await
    }

    async fn remove_peer(&self, session: &dyn RemoteSession, public_key: &str) -> Result<PeerChange> {
        debug!("Revoking {} centrally, not on {}", public_key, session.host());
        self.revoke_peer(public_key).await
    }

    async fn admit_peer(&self, peer: &PeerConfig) -> Result<PeerChange> {
        validate_peer_config(peer)?;
        let url = self.url("/api/v1/peers");
        let body = AdmissionRequest {
            public_key: &peer.public_key,
            allowed_ips: &peer.allowed_ips,
            label: &peer.label,
            user: self.settings.user.as_deref(),
            tags: &self.settings.tags,
        };

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Coordinator(format!("POST {}: {}", url, e)))?;

        match resp.status() {
            status if status.is_success() => {
                info!("Coordinator admitted {}", peer.public_key);
                Ok(PeerChange {
                    runtime_applied: true,
                    persisted: true,
                    ..Default::default()
                })
            }
            StatusCode::CONFLICT => {
                debug!("Coordinator already knows {}", peer.public_key);
                Ok(PeerChange {
                    persisted: true,
                    already_present: true,
                    ..Default::default()
                })
            }
            status => {
                let text = resp.text().await.unwrap_or_default();
                Err(Error::Coordinator(format!(
                    "admission of {} rejected ({}): {}",
                    peer.public_key,
                    status,
                    text.trim()
                )))
            }
        }
    }

    async fn revoke_peer(&self, public_key: &str) -> Result<PeerChange> {
        let url = self.url(&format!("/api/v1/peers/{}", urlencoding::encode(public_key)));
        let resp = self
            .http
            .delete(&url)
            .bearer_auth(&self.settings.api_key)
            .send()
            .await
            .map_err(|e| Error::Coordinator(format!("DELETE {}: {}", url, e)))?;

        match resp.status() {
            status if status.is_success() => {
                info!("Coordinator revoked {}", public_key);
                Ok(PeerChange {
                    runtime_applied: true,
                    persisted: true,
                    ..Default::default()
                })
            }
            StatusCode::NOT_FOUND => Ok(PeerChange {
                persisted: true,
                already_present: true,
                ..Default::default()
            }),
            status => {
                let text = resp.text().await.unwrap_or_default();
                Err(Error::Coordinator(format!(
                    "revocation of {} rejected ({}): {}",
                    public_key,
                    status,
                    text.trim()
                )))
            }
        }
    }

    async fn list_peers(&self, session: &dyn RemoteSession) -> Result<Vec<PeerInfo>> {
        let status = self.status(session).await?;
        let mut peers: Vec<PeerInfo> = status.peer.values().map(PeerInfo::from).collect();
        peers.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        Ok(peers)
    }

    async fn get_status(&self, session: &dyn RemoteSession) -> Result<ProviderStatus> {
        let status = self.status(session).await?;
        let self_node = status.self_node.as_ref();
        Ok(ProviderStatus {
            provider: self.name().to_string(),
            interface_up: status.backend_state == "Running",
            public_key: self_node.map(|n| n.public_key.clone()),
            listen_port: None,
            address: self_node.and_then(|n| n.tailscale_ips.first().cloned()),
            peer_count: status.peer.len(),
            detail: Some(format!("backend {}", status.backend_state)),
        })
    }

    fn generate_client_config(&self, request: &ClientConfigRequest) -> Result<String> {
        Ok(format!(
            r#"# Headscale enrollment for {label}
# Registry address: {address}
# Generated by meshvpn

tailscale up --login-server {server} --authkey <pre-auth key> --hostname {hostname}
"#,
            label = request.label,
            address = request.address,
            server = self.settings.server_url,
            hostname = shell_quote(&request.label),
        ))
    }
}
