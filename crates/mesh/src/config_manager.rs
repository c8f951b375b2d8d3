//! WireGuard peer management on a remote node
//!
//! Every mutation is applied twice: to the running interface with `wg set`
//! and to the wg-quick file so it survives a reboot. File rewrites follow
//! backup, write-to-temp-and-rename, re-read, parse; a rewrite that does not
//! parse back is rolled back from the backup.

use crate::wgconf::{self, WgConfig};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use ipnetwork::IpNetwork;
use meshvpn_common::{Error, PeerChange, PeerConfig, PeerInfo, Result, WG_KEY_LEN};
use meshvpn_remote::{shell_quote, RemoteSession};
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// Default wg-quick configuration directory
pub const DEFAULT_CONFIG_DIR: &str = "/etc/wireguard";

/// Default WireGuard listen port
pub const DEFAULT_LISTEN_PORT: u16 = 51820;

/// Validate a peer before anything touches a node
pub fn validate_peer_config(peer: &PeerConfig) -> Result<()> {
    validate_key("public key", &peer.public_key)?;

    if peer.allowed_ips.is_empty() {
        return Err(Error::InvalidPeerConfig("allowed IPs must not be empty".to_string()));
    }
    for cidr in &peer.allowed_ips {
        let valid = cidr.parse::<IpNetwork>().is_ok() || cidr.parse::<IpAddr>().is_ok();
        if !valid {
            return Err(Error::InvalidPeerConfig(format!("invalid allowed IP `{}`", cidr)));
        }
    }

    if peer.keepalive > u16::MAX as u32 {
        return Err(Error::InvalidPeerConfig(format!(
            "keepalive {} exceeds {}",
            peer.keepalive,
            u16::MAX
        )));
    }

    if let Some(endpoint) = &peer.endpoint {
        validate_endpoint(endpoint)?;
    }

    if let Some(psk) = &peer.preshared_key {
        validate_key("preshared key", psk)?;
    }

    Ok(())
}

fn validate_key(what: &str, key: &str) -> Result<()> {
    if key.len() != WG_KEY_LEN {
        return Err(Error::InvalidPeerConfig(format!(
            "{} must be {} characters, got {}",
            what,
            WG_KEY_LEN,
            key.len()
        )));
    }
    Ok(())
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidPeerConfig(format!("endpoint `{}` has no port", endpoint)))?;
    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return Err(Error::InvalidPeerConfig(format!("endpoint `{}` has no host", endpoint)));
    }
    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(()),
        _ => Err(Error::InvalidPeerConfig(format!(
            "endpoint `{}` has an invalid port",
            endpoint
        ))),
    }
}

/// Interface definition used when a node has no wg-quick file yet
#[derive(Debug, Clone)]
pub struct InterfaceSpec {
    /// Interface address in CIDR form, e.g. `10.8.0.1/24`
    pub address: String,
    /// Generated on the node when absent
    pub private_key: Option<String>,
    pub listen_port: u16,
}

/// Manages one WireGuard interface through a [`RemoteSession`]
#[derive(Debug, Clone)]
pub struct ConfigManager {
    interface: String,
    config_dir: String,
}

impl ConfigManager {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            config_dir: DEFAULT_CONFIG_DIR.to_string(),
        }
    }

    pub fn with_config_dir(mut self, dir: impl Into<String>) -> Self {
        self.config_dir = dir.into();
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn config_path(&self) -> String {
        format!(
            "{}/{}.conf",
            self.config_dir.trim_end_matches('/'),
            self.interface
        )
    }

    fn wg_show(&self, what: &str) -> String {
        format!("sudo wg show {} {}", shell_quote(&self.interface), what)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Public keys of every peer on the running interface
    pub async fn get_peers(&self, session: &dyn RemoteSession) -> Result<Vec<String>> {
        let output = session.execute(&self.wg_show("peers")).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub async fn peer_exists(&self, session: &dyn RemoteSession, public_key: &str) -> Result<bool> {
        Ok(self
            .get_peers(session)
            .await?
            .iter()
            .any(|k| k == public_key))
    }

    /// Live state of every peer
    pub async fn list_peer_info(&self, session: &dyn RemoteSession) -> Result<Vec<PeerInfo>> {
        let output = session.execute(&self.wg_show("dump")).await?;
        parse_dump(&output)
    }

    /// Live state of one peer
    pub async fn get_peer_info(&self, session: &dyn RemoteSession, public_key: &str) -> Result<PeerInfo> {
        self.list_peer_info(session)
            .await?
            .into_iter()
            .find(|p| p.public_key == public_key)
            .ok_or_else(|| Error::not_found("peer", public_key))
    }

    pub async fn interface_public_key(&self, session: &dyn RemoteSession) -> Result<String> {
        let output = session.execute(&self.wg_show("public-key")).await?;
        Ok(output.trim().to_string())
    }

    pub async fn listen_port(&self, session: &dyn RemoteSession) -> Result<Option<u16>> {
        let output = session.execute(&self.wg_show("listen-port")).await?;
        Ok(output.trim().parse().ok().filter(|p| *p != 0))
    }

    /// Whether the interface is up
    pub async fn interface_up(&self, session: &dyn RemoteSession) -> Result<bool> {
        let command = format!("sudo wg show {}", shell_quote(&self.interface));
        match session.execute(&command).await {
            Ok(_) => Ok(true),
            Err(Error::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn read_config(&self, session: &dyn RemoteSession) -> Result<String> {
        session
            .execute(&format!("sudo cat {}", shell_quote(&self.config_path())))
            .await
    }

    pub async fn parsed_config(&self, session: &dyn RemoteSession) -> Result<WgConfig> {
        wgconf::parse(&self.read_config(session).await?)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Add a peer to the running interface and the config file.
    ///
    /// A peer already on the interface is not re-applied. The file is
    /// reconciled either way; a failed file update is reported in the
    /// returned [`PeerChange`] rather than as an error.
    pub async fn add_peer(&self, session: &dyn RemoteSession, peer: &PeerConfig) -> Result<PeerChange> {
        validate_peer_config(peer)?;
        let host = session.host().to_string();
        let mut change = PeerChange::default();

        if self.peer_exists(session, &peer.public_key).await? {
            debug!("Peer {} already on {}@{}", short_key(&peer.public_key), self.interface, host);
            change.already_present = true;
        } else {
            self.apply_runtime(session, peer).await?;
            change.runtime_applied = true;
            info!("Added peer {} to {}@{}", short_key(&peer.public_key), self.interface, host);
        }

        let key = peer.public_key.clone();
        let outcome = self
            .persist(
                session,
                |content| {
                    if wgconf::parse(content)?.has_peer(&key) {
                        Ok(None)
                    } else {
                        Ok(Some(wgconf::append_peer(content, peer)))
                    }
                },
                |parsed| parsed.has_peer(&peer.public_key),
            )
            .await;
        self.record_persist(&mut change, &host, outcome);

        Ok(change)
    }

    /// Remove a peer from the running interface and the config file
    pub async fn remove_peer(&self, session: &dyn RemoteSession, public_key: &str) -> Result<PeerChange> {
        validate_key("public key", public_key)?;
        let host = session.host().to_string();
        let mut change = PeerChange::default();

        if self.peer_exists(session, public_key).await? {
            let command = format!(
                "sudo wg set {} peer {} remove",
                shell_quote(&self.interface),
                shell_quote(public_key)
            );
            session.execute(&command).await?;
            change.runtime_applied = true;
            info!("Removed peer {} from {}@{}", short_key(public_key), self.interface, host);
        } else {
            debug!("Peer {} not on {}@{}", short_key(public_key), self.interface, host);
            change.already_present = true;
        }

        let outcome = self
            .persist(
                session,
                |content| {
                    let (updated, removed) = wgconf::remove_peer(content, public_key);
                    Ok(removed.then_some(updated))
                },
                |parsed| !parsed.has_peer(public_key),
            )
            .await;
        self.record_persist(&mut change, &host, outcome);

        Ok(change)
    }

    fn record_persist(&self, change: &mut PeerChange, host: &str, outcome: Result<bool>) {
        match outcome {
            Ok(_) => change.persisted = true,
            Err(e) => {
                warn!(
                    "Runtime change on {}@{} was not persisted: {}",
                    self.interface, host, e
                );
                change.persist_error = Some(e.to_string());
            }
        }
    }

    async fn apply_runtime(&self, session: &dyn RemoteSession, peer: &PeerConfig) -> Result<()> {
        let mut command = String::new();
        if let Some(psk) = &peer.preshared_key {
            command.push_str(&format!("printf '%s' {} | ", shell_quote(psk)));
        }
        command.push_str(&format!(
            "sudo wg set {} peer {}",
            shell_quote(&self.interface),
            shell_quote(&peer.public_key)
        ));
        if peer.preshared_key.is_some() {
            command.push_str(" preshared-key /dev/stdin");
        }
        command.push_str(&format!(" allowed-ips {}", shell_quote(&peer.allowed_ips.join(","))));
        if let Some(endpoint) = &peer.endpoint {
            command.push_str(&format!(" endpoint {}", shell_quote(endpoint)));
        }
        if peer.keepalive > 0 {
            command.push_str(&format!(" persistent-keepalive {}", peer.keepalive));
        }
        session.execute(&command).await?;
        Ok(())
    }

    /// Rewrite the config file.
    ///
    /// `edit` returns `None` when the file already reflects the change.
    /// Returns whether the file was rewritten.
    async fn persist<E, V>(&self, session: &dyn RemoteSession, edit: E, verify: V) -> Result<bool>
    where
        E: FnOnce(&str) -> Result<Option<String>>,
        V: Fn(&WgConfig) -> bool,
    {
        let original = self
            .read_config(session)
            .await
            .map_err(|e| Error::Persistence(format!("reading {}: {}", self.config_path(), e)))?;

        let updated = match edit(&original) {
            Ok(Some(updated)) => updated,
            Ok(None) => return Ok(false),
            Err(e) => return Err(Error::Persistence(format!("existing config is invalid: {}", e))),
        };
        wgconf::parse(&updated)
            .map_err(|e| Error::Persistence(format!("refusing to write invalid config: {}", e)))?;

        let backup = self
            .backup_config(session)
            .await
            .map_err(|e| Error::Persistence(format!("backup failed: {}", e)))?;

        if let Err(e) = self.write_config(session, &updated).await {
            return Err(self.rollback(session, &backup, format!("write failed: {}", e)).await);
        }

        let check = match self.read_config(session).await {
            Ok(written) => wgconf::parse(&written).map(|cfg| verify(&cfg)),
            Err(e) => Err(e),
        };
        match check {
            Ok(true) => {
                debug!("Persisted {} on {} (backup {})", self.config_path(), session.host(), backup);
                Ok(true)
            }
            Ok(false) => Err(self
                .rollback(session, &backup, "rewritten config does not contain the change".to_string())
                .await),
            Err(e) => Err(self
                .rollback(session, &backup, format!("rewritten config failed validation: {}", e))
                .await),
        }
    }

    async fn rollback(&self, session: &dyn RemoteSession, backup: &str, reason: String) -> Error {
        warn!("Rolling back {} on {}: {}", self.config_path(), session.host(), reason);
        match self.restore_config(session, backup).await {
            Ok(()) => Error::Persistence(format!("{} (restored from {})", reason, backup)),
            Err(e) => Error::Persistence(format!("{}; restore from {} also failed: {}", reason, backup, e)),
        }
    }

    /// Write the config file through a temp file and rename
    pub async fn write_config(&self, session: &dyn RemoteSession, content: &str) -> Result<()> {
        let path = shell_quote(&self.config_path());
        let tmp = shell_quote(&format!("{}.tmp", self.config_path()));
        let command = format!(
            "printf '%s' {data} | base64 -d | sudo tee {tmp} > /dev/null && sudo chmod 600 {tmp} && sudo mv {tmp} {path}",
            data = BASE64.encode(content.as_bytes()),
            tmp = tmp,
            path = path
        );
        session.execute(&command).await?;
        Ok(())
    }

    /// Copy the config file aside; returns the backup path
    pub async fn backup_config(&self, session: &dyn RemoteSession) -> Result<String> {
        let backup = format!(
            "{}.bak.{}",
            self.config_path(),
            Utc::now().format("%Y%m%d%H%M%S%3f")
        );
        session
            .execute(&format!(
                "sudo cp -p {} {}",
                shell_quote(&self.config_path()),
                shell_quote(&backup)
            ))
            .await?;
        Ok(backup)
    }

    pub async fn restore_config(&self, session: &dyn RemoteSession, backup: &str) -> Result<()> {
        session
            .execute(&format!(
                "sudo cp -p {} {}",
                shell_quote(backup),
                shell_quote(&self.config_path())
            ))
            .await?;
        Ok(())
    }

    /// Write the running interface state to the config file (`wg-quick save`)
    pub async fn sync_config(&self, session: &dyn RemoteSession) -> Result<()> {
        let backup = self.backup_config(session).await?;
        let save = format!("sudo wg-quick save {}", shell_quote(&self.interface));
        if let Err(e) = session.execute(&save).await {
            return Err(self.rollback(session, &backup, format!("wg-quick save failed: {}", e)).await);
        }
        if let Err(e) = self.parsed_config(session).await {
            return Err(self
                .rollback(session, &backup, format!("saved config failed validation: {}", e))
                .await);
        }
        info!("Synced {} on {}", self.config_path(), session.host());
        Ok(())
    }

    /// Apply the config file to the running interface without a restart
    pub async fn reload_config(&self, session: &dyn RemoteSession) -> Result<()> {
        self.parsed_config(session).await?;
        let inner = format!(
            "wg syncconf {iface} <(wg-quick strip {iface})",
            iface = shell_quote(&self.interface)
        );
        session
            .execute(&format!("sudo bash -c {}", shell_quote(&inner)))
            .await?;
        info!("Reloaded {} on {}", self.interface, session.host());
        Ok(())
    }

    /// Create the wg-quick file if missing and bring the interface up
    pub async fn ensure_interface(&self, session: &dyn RemoteSession, spec: &InterfaceSpec) -> Result<()> {
        let test = format!("sudo test -f {}", shell_quote(&self.config_path()));
        let exists = match session.execute(&test).await {
            Ok(_) => true,
            Err(Error::CommandFailed { .. }) => false,
            Err(e) => return Err(e),
        };

        if !exists {
            let private_key = match &spec.private_key {
                Some(key) => key.clone(),
                None => session.execute("wg genkey").await?.trim().to_string(),
            };
            validate_key("private key", &private_key)?;
            let content = wgconf::render_interface(&spec.address, &private_key, spec.listen_port);
            self.write_config(session, &content).await?;
            info!("Created {} on {}", self.config_path(), session.host());
        }

        if !self.interface_up(session).await? {
            session
                .execute(&format!("sudo wg-quick up {}", shell_quote(&self.interface)))
                .await?;
            info!("Brought up {} on {}", self.interface, session.host());
        }

        Ok(())
    }
}

/// Parse `wg show <if> dump` output
pub fn parse_dump(output: &str) -> Result<Vec<PeerInfo>> {
    let mut peers = Vec::new();

    // First line describes the interface itself
    for line in output.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            return Err(Error::Internal(format!(
                "unexpected wg dump line with {} fields",
                fields.len()
            )));
        }

        let none_if = |v: &str| (v != "(none)" && !v.is_empty()).then(|| v.to_string());
        let number = |v: &str| {
            v.parse::<u64>()
                .map_err(|_| Error::Internal(format!("unexpected number `{}` in wg dump", v)))
        };

        let handshake = number(fields[4])? as i64;
        peers.push(PeerInfo {
            public_key: fields[0].to_string(),
            endpoint: none_if(fields[2]),
            allowed_ips: none_if(fields[3])
                .map(|v| v.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
            latest_handshake: (handshake > 0).then_some(handshake),
            transfer_rx: number(fields[5])?,
            transfer_tx: number(fields[6])?,
            persistent_keepalive: fields[7].parse().ok(),
        });
    }

    Ok(peers)
}

fn short_key(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimulatedFleet;
    use meshvpn_common::ConnectionConfig;
    use meshvpn_remote::Connector;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    const KEY: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";
    const PSK: &str = "Zm9vYmFyYmF6cXV4Zm9vYmFyYmF6cXV4Zm9vYmFyYmE=";

    fn peer() -> PeerConfig {
        let mut peer = PeerConfig::new(KEY, vec!["10.8.0.2/32".to_string()]);
        peer.keepalive = 25;
        peer.label = "laptop".to_string();
        peer
    }

    async fn session(fleet: &Arc<SimulatedFleet>, host: &str) -> Arc<dyn RemoteSession> {
        fleet
            .connect(&CancellationToken::new(), ConnectionConfig::new(host))
            .await
            .unwrap()
    }

    #[test]
    fn test_validation_rules() {
        assert!(validate_peer_config(&peer()).is_ok());

        let mut short = peer();
        short.public_key = "abc".to_string();
        assert!(validate_peer_config(&short).is_err());

        let mut empty = peer();
        empty.allowed_ips.clear();
        assert!(validate_peer_config(&empty).is_err());

        let mut bad_ip = peer();
        bad_ip.allowed_ips = vec!["10.8.0.300/32".to_string()];
        assert!(validate_peer_config(&bad_ip).is_err());

        let mut bad_endpoint = peer();
        bad_endpoint.endpoint = Some("vpn.example.com".to_string());
        assert!(validate_peer_config(&bad_endpoint).is_err());
        bad_endpoint.endpoint = Some("vpn.example.com:0".to_string());
        assert!(validate_peer_config(&bad_endpoint).is_err());
        bad_endpoint.endpoint = Some("[2001:db8::1]:51820".to_string());
        assert!(validate_peer_config(&bad_endpoint).is_ok());

        let mut keepalive = peer();
        keepalive.keepalive = 70_000;
        assert!(validate_peer_config(&keepalive).is_err());
    }

    #[test]
    fn test_parse_dump() {
        let dump = "cHJpdmF0ZQ==\tcHVibGlj\t51820\toff\n\
                    KEY1\t(none)\t203.0.113.7:41000\t10.8.0.2/32,10.9.0.0/16\t1700000000\t1024\t2048\t25\n\
                    KEY2\t(none)\t(none)\t10.8.0.3/32\t0\t0\t0\toff\n";
        let peers = parse_dump(dump).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].endpoint.as_deref(), Some("203.0.113.7:41000"));
        assert_eq!(peers[0].allowed_ips.len(), 2);
        assert_eq!(peers[0].latest_handshake, Some(1_700_000_000));
        assert_eq!(peers[0].persistent_keepalive, Some(25));
        assert_eq!(peers[1].endpoint, None);
        assert_eq!(peers[1].latest_handshake, None);
        assert_eq!(peers[1].persistent_keepalive, None);
    }

    #[tokio::test]
    async fn test_add_peer_applies_and_persists() {
        let fleet = SimulatedFleet::new();
        let host = fleet.add_host("203.0.113.10");
        let session = session(&fleet, "203.0.113.10").await;
        let manager = ConfigManager::new("wg0");

        let change = manager.add_peer(session.as_ref(), &peer()).await.unwrap();
        assert!(change.runtime_applied);
        assert!(change.persisted);
        assert!(!change.already_present);

        assert!(host.has_runtime_peer(KEY));
        let config = wgconf::parse(&host.config_file()).unwrap();
        assert!(config.has_peer(KEY));
        assert!(manager.peer_exists(session.as_ref(), KEY).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_peer_is_idempotent() {
        let fleet = SimulatedFleet::new();
        let host = fleet.add_host("203.0.113.10");
        let session = session(&fleet, "203.0.113.10").await;
        let manager = ConfigManager::new("wg0");

        manager.add_peer(session.as_ref(), &peer()).await.unwrap();
        let again = manager.add_peer(session.as_ref(), &peer()).await.unwrap();
        assert!(again.already_present);
        assert!(!again.runtime_applied);
        assert!(again.persisted);

        let config = wgconf::parse(&host.config_file()).unwrap();
        assert_eq!(config.peer_keys(), vec![KEY]);
        assert_eq!(host.commands_matching("wg set").len(), 1);
    }

    #[tokio::test]
    async fn test_add_peer_with_preshared_key() {
        let fleet = SimulatedFleet::new();
        let host = fleet.add_host("203.0.113.10");
        let session = session(&fleet, "203.0.113.10").await;
        let manager = ConfigManager::new("wg0");

        let mut with_psk = peer();
        with_psk.preshared_key = Some(PSK.to_string());
        manager.add_peer(session.as_ref(), &with_psk).await.unwrap();

        let set = host.commands_matching("wg set");
        assert!(set[0].contains("preshared-key /dev/stdin"));
        assert!(host.config_file().contains(&format!("PresharedKey = {}", PSK)));
    }

    #[tokio::test]
    async fn test_invalid_peer_never_reaches_node() {
        let fleet = SimulatedFleet::new();
        let host = fleet.add_host("203.0.113.10");
        let session = session(&fleet, "203.0.113.10").await;
        let manager = ConfigManager::new("wg0");

        let mut bad = peer();
        bad.public_key = "too-short".to_string();
        let err = manager.add_peer(session.as_ref(), &bad).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPeerConfig(_)));
        assert!(host.commands().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back_and_reports() {
        let fleet = SimulatedFleet::new();
        let host = fleet.add_host("203.0.113.10");
        let session = session(&fleet, "203.0.113.10").await;
        let manager = ConfigManager::new("wg0");
        let before = host.config_file();

        host.fail_commands_containing("base64 -d");
        let change = manager.add_peer(session.as_ref(), &peer()).await.unwrap();

        assert!(change.runtime_applied);
        assert!(!change.persisted);
        assert!(!change.is_reboot_safe());
        assert!(change.persist_error.unwrap().contains("restored from"));
        assert!(host.has_runtime_peer(KEY));
        assert_eq!(host.config_file(), before);
    }

    #[tokio::test]
    async fn test_corrupt_rewrite_is_rolled_back() {
        let fleet = SimulatedFleet::new();
        let host = fleet.add_host("203.0.113.10");
        let session = session(&fleet, "203.0.113.10").await;
        let manager = ConfigManager::new("wg0");
        let before = host.config_file();

        host.corrupt_writes(true);
        let change = manager.add_peer(session.as_ref(), &peer()).await.unwrap();

        assert!(!change.persisted);
        assert!(change.persist_error.unwrap().contains("failed validation"));
        assert_eq!(host.config_file(), before);
    }

    #[tokio::test]
    async fn test_remove_peer() {
        let fleet = SimulatedFleet::new();
        let host = fleet.add_host("203.0.113.10");
        let session = session(&fleet, "203.0.113.10").await;
        let manager = ConfigManager::new("wg0");

        manager.add_peer(session.as_ref(), &peer()).await.unwrap();
        let change = manager.remove_peer(session.as_ref(), KEY).await.unwrap();
        assert!(change.runtime_applied);
        assert!(change.persisted);
        assert!(!host.has_runtime_peer(KEY));
        assert!(!wgconf::parse(&host.config_file()).unwrap().has_peer(KEY));

        let again = manager.remove_peer(session.as_ref(), KEY).await.unwrap();
        assert!(again.already_present);
        assert!(again.persisted);
    }

    #[tokio::test]
    async fn test_peer_info_and_interface_key() {
        let fleet = SimulatedFleet::new();
        let host = fleet.add_host("203.0.113.10");
        let session = session(&fleet, "203.0.113.10").await;
        let manager = ConfigManager::new("wg0");

        manager.add_peer(session.as_ref(), &peer()).await.unwrap();
        let info = manager.get_peer_info(session.as_ref(), KEY).await.unwrap();
        assert_eq!(info.allowed_ips, vec!["10.8.0.2/32"]);
        assert_eq!(info.persistent_keepalive, Some(25));

        let missing = manager
            .get_peer_info(session.as_ref(), PSK)
            .await
            .unwrap_err();
        assert!(matches!(missing, Error::NotFound { .. }));

        let key = manager.interface_public_key(session.as_ref()).await.unwrap();
        assert_eq!(key, host.public_key());
        assert_eq!(manager.listen_port(session.as_ref()).await.unwrap(), Some(51820));
    }

    #[tokio::test]
    async fn test_sync_and_reload() {
        let fleet = SimulatedFleet::new();
        let host = fleet.add_host("203.0.113.10");
        let session = session(&fleet, "203.0.113.10").await;
        let manager = ConfigManager::new("wg0");

        // Runtime-only peer, then save it to disk
        session
            .execute(&format!("sudo wg set wg0 peer {} allowed-ips 10.8.0.7/32", KEY))
            .await
            .unwrap();
        manager.sync_config(session.as_ref()).await.unwrap();
        assert!(wgconf::parse(&host.config_file()).unwrap().has_peer(KEY));

        // Drop it from runtime and let the file bring it back
        session
            .execute(&format!("sudo wg set wg0 peer {} remove", KEY))
            .await
            .unwrap();
        assert!(!host.has_runtime_peer(KEY));
        manager.reload_config(session.as_ref()).await.unwrap();
        assert!(host.has_runtime_peer(KEY));
    }

    #[tokio::test]
    async fn test_ensure_interface_creates_config() {
        let fleet = SimulatedFleet::new();
        let host = fleet.add_bare_host("203.0.113.20");
        let session = session(&fleet, "203.0.113.20").await;
        let manager = ConfigManager::new("wg0");

        let spec = InterfaceSpec {
            address: "10.8.0.1/24".to_string(),
            private_key: None,
            listen_port: DEFAULT_LISTEN_PORT,
        };
        manager.ensure_interface(session.as_ref(), &spec).await.unwrap();

        let config = wgconf::parse(&host.config_file()).unwrap();
        assert_eq!(config.address(), Some("10.8.0.1/24"));
        assert!(manager.interface_up(session.as_ref()).await.unwrap());

        // Second run leaves everything alone
        let writes = host.commands_matching("base64 -d").len();
        manager.ensure_interface(session.as_ref(), &spec).await.unwrap();
        assert_eq!(host.commands_matching("base64 -d").len(), writes);
    }
}
