//! Self-managed WireGuard provider
//!
//! Peers are admitted node by node through [`ConfigManager`]; there is no
//! central authority.

use super::{ClientConfigRequest, NodeEnrollment, ProviderStatus, VpnProvider};
use crate::config_manager::{ConfigManager, InterfaceSpec, DEFAULT_CONFIG_DIR, DEFAULT_LISTEN_PORT};
use async_trait::async_trait;
use meshvpn_common::{Error, PeerChange, PeerConfig, PeerInfo, Result};
use meshvpn_remote::RemoteSession;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::info;

/// Package install for the common distro families
const INSTALL_SCRIPT: &str = r#"
if command -v wg >/dev/null 2>&1 && command -v wg-quick >/dev/null 2>&1; then
  exit 0
fi
if command -v apt-get >/dev/null 2>&1; then
  sudo DEBIAN_FRONTEND=noninteractive apt-get update -qq
  sudo DEBIAN_FRONTEND=noninteractive apt-get install -y -qq wireguard-tools
elif command -v dnf >/dev/null 2>&1; then
  sudo dnf install -y wireguard-tools
elif command -v yum >/dev/null 2>&1; then
  sudo yum install -y epel-release
  sudo yum install -y wireguard-tools
elif command -v apk >/dev/null 2>&1; then
  sudo apk add --no-cache wireguard-tools
else
  echo "no supported package manager found" >&2
  exit 1
fi
sudo sysctl -q -w net.ipv4.ip_forward=1
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireGuardSettings {
    pub interface: String,
    pub config_dir: String,
    pub listen_port: u16,
}

impl Default for WireGuardSettings {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            config_dir: DEFAULT_CONFIG_DIR.to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
        }
    }
}

/// WireGuard provider
#[derive(Debug, Clone)]
pub struct WireGuardProvider {
    settings: WireGuardSettings,
    config: ConfigManager,
}

impl WireGuardProvider {
    pub fn new(settings: WireGuardSettings) -> Self {
        let config = ConfigManager::new(settings.interface.clone()).with_config_dir(settings.config_dir.clone());
        Self { settings, config }
    }

    pub fn config_manager(&self) -> &ConfigManager {
        &self.config
    }
}

#[async_trait]
impl VpnProvider for WireGuardProvider {
    fn name(&self) -> &str {
        "wireguard"
    }

    fn requires_coordinator(&self) -> bool {
        false
    }

    async fn install(&self, session: &dyn RemoteSession) -> Result<()> {
        session.execute_script(INSTALL_SCRIPT).await?;
        info!("WireGuard tools present on {}", session.host());
        Ok(())
    }

    async fn configure(&self, session: &dyn RemoteSession, enrollment: &NodeEnrollment) -> Result<()> {
        let address = enrollment.address.clone().ok_or_else(|| {
            Error::Provider(format!(
                "node {} needs an interface address to enroll",
                enrollment.node.name
            ))
        })?;
        let spec = InterfaceSpec {
            address,
            private_key: enrollment.private_key.clone(),
            listen_port: self.settings.listen_port,
        };
        self.config.ensure_interface(session, &spec).await
    }

    async fn add_peer(&self, session: &dyn RemoteSession, peer: &PeerConfig) -> Result<PeerChange> {
        self.config.add_peer(session, peer).await
    }

    async fn remove_peer(&self, session: &dyn RemoteSession, public_key: &str) -> Result<PeerChange> {
        self.config.remove_peer(session, public_key).await
    }

    async fn list_peers(&self, session: &dyn RemoteSession) -> Result<Vec<PeerInfo>> {
        self.config.list_peer_info(session).await
    }

    async fn get_status(&self, session: &dyn RemoteSession) -> Result<ProviderStatus> {
        let mut status = ProviderStatus {
            provider: self.name().to_string(),
            ..Default::default()
        };

        status.interface_up = self.config.interface_up(session).await?;
        if status.interface_up {
            status.public_key = Some(self.config.interface_public_key(session).await?);
            status.listen_port = self.config.listen_port(session).await?;
            status.peer_count = self.config.get_peers(session).await?.len();
        } else {
            status.detail = Some(format!("interface {} is down", self.settings.interface));
        }

        match self.config.parsed_config(session).await {
            Ok(parsed) => status.address = parsed.address().map(str::to_string),
            Err(e) => status.detail = Some(format!("config unreadable: {}", e)),
        }

        Ok(status)
    }

    fn generate_client_config(&self, request: &ClientConfigRequest) -> Result<String> {
        if request.servers.is_empty() {
            return Err(Error::Provider("no reachable servers to peer with".to_string()));
        }

        let prefix = match request.address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let private_key = request
            .private_key
            .clone()
            .unwrap_or_else(|| "<paste your private key>".to_string());
        let dns_line = request
            .dns
            .as_ref()
            .map(|d| format!("DNS = {}\n", d))
            .unwrap_or_default();

        let mut config = format!(
            r#"# WireGuard configuration for {label}
# Generated by meshvpn

[Interface]
PrivateKey = {private_key}
Address = {address}/{prefix}
{dns_line}"#,
            label = request.label,
            private_key = private_key,
            address = request.address,
            prefix = prefix,
            dns_line = dns_line,
        );

        for server in &request.servers {
            let endpoint_line = server
                .endpoint
                .as_ref()
                .map(|e| format!("Endpoint = {}", e))
                .unwrap_or_else(|| format!("# Endpoint = {}:{}", server.name, self.settings.listen_port));
            config.push_str(&format!(
                r#"
[Peer]
# {name}
PublicKey = {public_key}
AllowedIPs = {allowed_ips}
{endpoint_line}
PersistentKeepalive = {keepalive}
"#,
                name = server.name,
                public_key = server.public_key,
                allowed_ips = server.allowed_ips.join(", "),
                endpoint_line = endpoint_line,
                keepalive = request.keepalive,
            ));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ServerPeer;
    use crate::testing::SimulatedFleet;
    use crate::wgconf;
    use meshvpn_common::{ConnectionConfig, NodeInfo};
    use meshvpn_remote::Connector;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_install_runs_script_once() {
        let fleet = SimulatedFleet::new();
        let host = fleet.add_bare_host("192.0.2.5");
        let session = fleet
            .connect(&CancellationToken::new(), ConnectionConfig::new("192.0.2.5"))
            .await
            .unwrap();

        let provider = WireGuardProvider::new(WireGuardSettings::default());
        provider.install(session.as_ref()).await.unwrap();

        let scripts = host.scripts();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].contains("wireguard-tools"));
    }

    #[tokio::test]
    async fn test_configure_and_status() {
        let fleet = SimulatedFleet::new();
        fleet.add_bare_host("192.0.2.5");
        let session = fleet
            .connect(&CancellationToken::new(), ConnectionConfig::new("192.0.2.5"))
            .await
            .unwrap();
        let provider = WireGuardProvider::new(WireGuardSettings::default());

        let down = provider.get_status(session.as_ref()).await.unwrap();
        assert!(!down.interface_up);
        assert!(!provider.is_healthy(session.as_ref()).await);

        let mut enrollment = NodeEnrollment::new(NodeInfo::new("edge-1", "192.0.2.5", "aws"));
        enrollment.address = Some("10.8.0.1/24".to_string());
        provider.configure(session.as_ref(), &enrollment).await.unwrap();

        let status = provider.get_status(session.as_ref()).await.unwrap();
        assert!(status.interface_up);
        assert_eq!(status.address.as_deref(), Some("10.8.0.1/24"));
        assert_eq!(status.listen_port, Some(51820));
        assert!(provider.is_healthy(session.as_ref()).await);
    }

    #[tokio::test]
    async fn test_configure_requires_address() {
        let fleet = SimulatedFleet::new();
        fleet.add_bare_host("192.0.2.5");
        let session = fleet
            .connect(&CancellationToken::new(), ConnectionConfig::new("192.0.2.5"))
            .await
            .unwrap();
        let provider = WireGuardProvider::new(WireGuardSettings::default());

        let enrollment = NodeEnrollment::new(NodeInfo::new("edge-1", "192.0.2.5", "aws"));
        let err = provider.configure(session.as_ref(), &enrollment).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }

    #[test]
    fn test_client_config_renders() {
        let provider = WireGuardProvider::new(WireGuardSettings::default());
        let request = ClientConfigRequest {
            label: "laptop".to_string(),
            address: "10.8.0.2".parse().unwrap(),
            private_key: None,
            dns: Some("10.8.0.1".to_string()),
            keepalive: 25,
            servers: vec![
                ServerPeer {
                    name: "node-1".to_string(),
                    public_key: "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=".to_string(),
                    endpoint: Some("198.51.100.1:51820".to_string()),
                    allowed_ips: vec!["10.8.0.1/32".to_string()],
                },
                ServerPeer {
                    name: "node-2".to_string(),
                    public_key: "TrMvSoP4jYQlY6RIzBgbssQqY3vxI2Pi+y71lOWWXX0=".to_string(),
                    endpoint: None,
                    allowed_ips: vec!["10.8.0.10/32".to_string()],
                },
            ],
        };

        let config = provider.generate_client_config(&request).unwrap();
        assert!(config.contains("Address = 10.8.0.2/32"));
        assert!(config.contains("DNS = 10.8.0.1"));
        assert!(config.contains("Endpoint = 198.51.100.1:51820"));
        assert!(config.contains("# Endpoint = node-2:51820"));

        let parsed = wgconf::parse(&config).unwrap();
        assert_eq!(parsed.peers.len(), 2);
    }

    #[tokio::test]
    async fn test_no_central_admission() {
        let provider = WireGuardProvider::new(WireGuardSettings::default());
        assert!(!provider.requires_coordinator());
        let peer = meshvpn_common::PeerConfig::new("xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=", vec![]);
        assert!(matches!(provider.admit_peer(&peer).await, Err(Error::Provider(_))));
        assert!(provider.revoke_peer(&peer.public_key).await.is_err());
    }

    #[test]
    fn test_client_config_needs_servers() {
        let provider = WireGuardProvider::new(WireGuardSettings::default());
        let request = ClientConfigRequest {
            label: "laptop".to_string(),
            address: "10.8.0.2".parse().unwrap(),
            private_key: None,
            dns: None,
            keepalive: 25,
            servers: Vec::new(),
        };
        assert!(provider.generate_client_config(&request).is_err());
    }
}
