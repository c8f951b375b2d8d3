//! SSH client for node access
//!
//! A [`ConnectionManager`] holds one private key and dials nodes either
//! directly or through a bastion. In the bastion case a `direct-tcpip`
//! channel is opened from the bastion to the target and a second SSH
//! handshake runs over it, so both hops authenticate with the same key.

use crate::health::probe_ssh_banner;
use crate::session::{Connector, RemoteSession};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meshvpn_common::{ConnectionConfig, Error, Hop, Result, RetryPolicy};
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Captured output of one remote command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// russh client handler
struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // Cluster nodes are ephemeral and never land in a known_hosts store
        Ok(true)
    }
}

type SshHandle = Handle<ClientHandler>;

// ============================================================================
// Connection manager
// ============================================================================

/// Dials authenticated SSH connections with a single shared identity
pub struct ConnectionManager {
    key: Arc<KeyPair>,
    retry: RetryPolicy,
}

impl ConnectionManager {
    /// Load the private key from a PEM / OpenSSH file
    pub async fn from_key_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pem = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::InvalidConfig(format!("failed to read SSH key {}: {}", path.display(), e))
        })?;
        let manager = Self::from_pem(&pem)?;
        info!("Loaded SSH identity from {}", path.display());
        Ok(manager)
    }

    /// Build from an in-memory private key
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = russh_keys::decode_secret_key(pem, None)
            .map_err(|e| Error::InvalidConfig(format!("failed to decode SSH private key: {}", e)))?;
        Ok(Self {
            key: Arc::new(key),
            retry: RetryPolicy::ssh(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Open a connection, retrying dials under the configured policy.
    ///
    /// A bastion is probed once up front; a dead bastion fails fast instead
    /// of consuming the retry budget.
    pub async fn connect_ssh(
        &self,
        cancel: &CancellationToken,
        config: ConnectionConfig,
    ) -> Result<SshConnection> {
        let config = config.with_defaults();

        if let Some(bastion) = &config.bastion {
            probe_ssh_banner(&bastion.host, bastion.port, config.dial_timeout)
                .await
                .map_err(|message| Error::Bastion {
                    host: bastion.host.clone(),
                    message,
                })?;
        }

        let operation = format!("ssh {}@{}:{}", config.user, config.host, config.port);
        let connection = self
            .retry
            .execute(cancel, &operation, |attempt| {
                debug!("Dialing {} (attempt {})", operation, attempt);
                self.dial(&config)
            })
            .await?;

        info!(
            "Connected to {}{}",
            operation,
            config
                .bastion
                .as_ref()
                .map(|b| format!(" via bastion {}", b.host))
                .unwrap_or_default()
        );
        Ok(connection)
    }

    async fn dial(&self, config: &ConnectionConfig) -> Result<SshConnection> {
        let Some(bastion) = &config.bastion else {
            let target = self
                .open_direct(&config.host, config.port, &config.user, config, Hop::Target)
                .await?;
            return Ok(SshConnection::new(config, target, None));
        };

        let jump = self
            .open_direct(&bastion.host, bastion.port, &bastion.user, config, Hop::Bastion)
            .await?;

        match self.open_via(&jump, config).await {
            Ok(target) => Ok(SshConnection::new(config, target, Some(jump))),
            Err(e) => {
                disconnect_quietly(&jump).await;
                Err(e)
            }
        }
    }

    async fn open_direct(
        &self,
        host: &str,
        port: u16,
        user: &str,
        config: &ConnectionConfig,
        hop: Hop,
    ) -> Result<SshHandle> {
        let fail = |message: String| Error::Connection {
            hop,
            host: host.to_string(),
            message,
        };

        let stream = tokio::time::timeout(config.dial_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| fail(format!("dial timed out after {:?}", config.dial_timeout)))?
            .map_err(|e| fail(format!("dial failed: {}", e)))?;

        let handle = tokio::time::timeout(
            config.dial_timeout,
            client::connect_stream(client_config(config), stream, ClientHandler),
        )
        .await
        .map_err(|_| fail("handshake timed out".to_string()))?
        .map_err(|e| fail(format!("handshake failed: {}", e)))?;

        self.authenticate(handle, user, host, hop).await
    }

    async fn open_via(&self, jump: &SshHandle, config: &ConnectionConfig) -> Result<SshHandle> {
        let fail = |message: String| Error::Connection {
            hop: Hop::Target,
            host: config.host.clone(),
            message,
        };

        let channel = tokio::time::timeout(
            config.dial_timeout,
            jump.channel_open_direct_tcpip(config.host.clone(), config.port as u32, "127.0.0.1", 0),
        )
        .await
        .map_err(|_| fail("tunnel through bastion timed out".to_string()))?
        .map_err(|e| fail(format!("tunnel through bastion failed: {}", e)))?;

        let handle = tokio::time::timeout(
            config.dial_timeout,
            client::connect_stream(client_config(config), channel.into_stream(), ClientHandler),
        )
        .await
        .map_err(|_| fail("handshake over tunnel timed out".to_string()))?
        .map_err(|e| fail(format!("handshake over tunnel failed: {}", e)))?;

        self.authenticate(handle, &config.user, &config.host, Hop::Target).await
    }

    async fn authenticate(
        &self,
        mut handle: SshHandle,
        user: &str,
        host: &str,
        hop: Hop,
    ) -> Result<SshHandle> {
        let message = match handle.authenticate_publickey(user, self.key.clone()).await {
            Ok(true) => return Ok(handle),
            Ok(false) => format!("public key rejected for user {}", user),
            Err(e) => format!("authentication failed: {}", e),
        };
        disconnect_quietly(&handle).await;
        Err(Error::Connection {
            hop,
            host: host.to_string(),
            message,
        })
    }
}

#[async_trait]
impl Connector for ConnectionManager {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        config: ConnectionConfig,
    ) -> Result<Arc<dyn RemoteSession>> {
        let connection = self.connect_ssh(cancel, config).await?;
        Ok(Arc::new(connection))
    }
}

fn client_config(config: &ConnectionConfig) -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: Some(config.command_timeout + config.dial_timeout),
        ..Default::default()
    })
}

async fn disconnect_quietly(handle: &SshHandle) {
    if let Err(e) = handle.disconnect(Disconnect::ByApplication, "", "en").await {
        debug!("Ignoring disconnect error: {}", e);
    }
}

// ============================================================================
// Connection
// ============================================================================

struct Hops {
    target: SshHandle,
    bastion: Option<SshHandle>,
}

/// Live SSH connection, optionally chained through a bastion.
///
/// All commands and the close are serialized on one mutex. Once closed the
/// connection cannot be reused.
pub struct SshConnection {
    host: String,
    bastion_host: Option<String>,
    command_timeout: Duration,
    connected_at: DateTime<Utc>,
    hops: Mutex<Option<Hops>>,
}

impl SshConnection {
    fn new(config: &ConnectionConfig, target: SshHandle, bastion: Option<SshHandle>) -> Self {
        Self {
            host: config.host.clone(),
            bastion_host: config.bastion.as_ref().map(|b| b.host.clone()),
            command_timeout: config.command_timeout,
            connected_at: Utc::now(),
            hops: Mutex::new(Some(Hops { target, bastion })),
        }
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn bastion_host(&self) -> Option<&str> {
        self.bastion_host.as_deref()
    }

    /// Run a command and return everything it produced, whatever the exit code
    pub async fn run(&self, command: &str) -> Result<CommandOutput> {
        let guard = self.hops.lock().await;
        let hops = guard
            .as_ref()
            .ok_or_else(|| Error::ConnectionClosed(self.host.clone()))?;

        debug!("[{}] $ {}", self.host, first_line(command));

        match tokio::time::timeout(self.command_timeout, run_on(&hops.target, &self.host, command)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                seconds: self.command_timeout.as_secs(),
            }),
        }
    }
}

#[async_trait]
impl RemoteSession for SshConnection {
    fn host(&self) -> &str {
        &self.host
    }

    async fn execute(&self, command: &str) -> Result<String> {
        let output = self.run(command).await?;
        if output.success() {
            return Ok(output.stdout);
        }
        Err(Error::CommandFailed {
            command: first_line(command).to_string(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr.trim().to_string(),
        })
    }

    async fn is_alive(&self) -> bool {
        let guard = self.hops.lock().await;
        let Some(hops) = guard.as_ref() else {
            return false;
        };
        if hops.target.is_closed() {
            return false;
        }
        match tokio::time::timeout(Duration::from_secs(10), hops.target.channel_open_session()).await {
            Ok(Ok(channel)) => {
                let _ = channel.close().await;
                true
            }
            _ => false,
        }
    }

    async fn close(&self) -> Result<()> {
        let Some(hops) = self.hops.lock().await.take() else {
            return Ok(());
        };

        let mut failures = Vec::new();
        if let Err(e) = hops.target.disconnect(Disconnect::ByApplication, "", "en").await {
            failures.push(format!("target: {}", e));
        }
        if let Some(bastion) = hops.bastion {
            if let Err(e) = bastion.disconnect(Disconnect::ByApplication, "", "en").await {
                failures.push(format!("bastion: {}", e));
            }
        }

        if failures.is_empty() {
            debug!("Closed connection to {}", self.host);
            Ok(())
        } else {
            warn!("Errors closing connection to {}: {}", self.host, failures.join("; "));
            Err(Error::Connection {
                hop: Hop::Target,
                host: self.host.clone(),
                message: format!("close failed: {}", failures.join("; ")),
            })
        }
    }
}

async fn run_on(handle: &SshHandle, host: &str, command: &str) -> Result<CommandOutput> {
    let session_err = |e: russh::Error| Error::Connection {
        hop: Hop::Target,
        host: host.to_string(),
        message: format!("session error: {}", e),
    };

    let mut channel = handle.channel_open_session().await.map_err(session_err)?;
    channel.exec(true, command).await.map_err(session_err)?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => {
                stdout.extend_from_slice(&data);
            }
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                if ext == 1 {
                    stderr.extend_from_slice(&data);
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                exit_code = Some(exit_status);
            }
            Some(ChannelMsg::Close) | None => break,
            _ => {}
        }
    }

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
        exit_code,
    })
}

fn first_line(command: &str) -> &str {
    command.lines().next().unwrap_or(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshvpn_common::BastionConfig;
    use russh::server::{self, Auth, Msg, Server as _, Session};
    use russh::{Channel, ChannelId, CryptoVec};
    use tokio::net::TcpListener;

    /// In-process SSH server answering a few canned commands
    #[derive(Clone)]
    struct FakeNode {
        name: &'static str,
        users: Arc<std::sync::Mutex<Vec<String>>>,
        commands: Arc<std::sync::Mutex<Vec<String>>>,
        tunnels: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl FakeNode {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                users: Arc::default(),
                commands: Arc::default(),
                tunnels: Arc::default(),
            }
        }

        fn users(&self) -> Vec<String> {
            self.users.lock().unwrap().clone()
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        fn tunnels(&self) -> Vec<String> {
            self.tunnels.lock().unwrap().clone()
        }
    }

    impl server::Server for FakeNode {
        type Handler = Self;

        fn new_client(&mut self, _: Option<std::net::SocketAddr>) -> Self {
            self.clone()
        }
    }

    #[async_trait]
    impl server::Handler for FakeNode {
        type Error = russh::Error;

        async fn auth_publickey(
            &mut self,
            user: &str,
            _public_key: &PublicKey,
        ) -> std::result::Result<Auth, Self::Error> {
            self.users.lock().unwrap().push(user.to_string());
            Ok(Auth::Accept)
        }

        async fn channel_open_session(
            &mut self,
            _channel: Channel<Msg>,
            _session: &mut Session,
        ) -> std::result::Result<bool, Self::Error> {
            Ok(true)
        }

        async fn exec_request(
            &mut self,
            channel: ChannelId,
            data: &[u8],
            session: &mut Session,
        ) -> std::result::Result<(), Self::Error> {
            let command = String::from_utf8_lossy(data).to_string();
            self.commands.lock().unwrap().push(command.clone());
            session.channel_success(channel);

            let (stdout, stderr, code) = match command.as_str() {
                // Never answers
                "sleep" => return Ok(()),
                "hostname" => (format!("{}\n", self.name), String::new(), 0),
                "fail" => ("partial\n".to_string(), "boom\n".to_string(), 3),
                other => (String::new(), format!("{}: not found\n", other), 127),
            };
            if !stdout.is_empty() {
                session.data(channel, CryptoVec::from(stdout));
            }
            if !stderr.is_empty() {
                session.extended_data(channel, 1, CryptoVec::from(stderr));
            }
            session.exit_status_request(channel, code);
            session.eof(channel);
            session.close(channel);
            Ok(())
        }

        async fn channel_open_direct_tcpip(
            &mut self,
            channel: Channel<Msg>,
            host_to_connect: &str,
            port_to_connect: u32,
            _originator_address: &str,
            _originator_port: u32,
            _session: &mut Session,
        ) -> std::result::Result<bool, Self::Error> {
            self.tunnels
                .lock()
                .unwrap()
                .push(format!("{}:{}", host_to_connect, port_to_connect));
            let Ok(mut upstream) = TcpStream::connect((host_to_connect, port_to_connect as u16)).await else {
                return Ok(false);
            };
            tokio::spawn(async move {
                let mut stream = channel.into_stream();
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
            });
            Ok(true)
        }
    }

    async fn spawn_node(name: &'static str) -> (u16, FakeNode) {
        let node = FakeNode::new(name);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = Arc::new(server::Config {
            keys: vec![KeyPair::generate_ed25519().unwrap()],
            ..Default::default()
        });
        let mut server = node.clone();
        tokio::spawn(async move {
            let _ = server.run_on_socket(config, &listener).await;
        });
        (port, node)
    }

    fn test_manager() -> ConnectionManager {
        ConnectionManager {
            key: Arc::new(KeyPair::generate_ed25519().unwrap()),
            retry: RetryPolicy::once(),
        }
    }

    fn local(port: u16) -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1").with_port(port).with_user("ubuntu")
    }

    #[tokio::test]
    async fn test_connect_and_execute() {
        let (port, node) = spawn_node("edge-1").await;
        let connection = test_manager()
            .connect_ssh(&CancellationToken::new(), local(port))
            .await
            .unwrap();

        assert_eq!(connection.execute("hostname").await.unwrap(), "edge-1\n");
        assert!(connection.is_alive().await);
        assert_eq!(connection.bastion_host(), None);
        assert_eq!(node.users(), vec!["ubuntu"]);
        assert_eq!(node.commands(), vec!["hostname"]);
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_exit_keeps_both_streams() {
        let (port, _node) = spawn_node("edge-1").await;
        let connection = test_manager()
            .connect_ssh(&CancellationToken::new(), local(port))
            .await
            .unwrap();

        let output = connection.run("fail").await.unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout, "partial\n");
        assert_eq!(output.stderr, "boom\n");

        match connection.execute("fail").await.unwrap_err() {
            Error::CommandFailed {
                command,
                exit_code,
                stdout,
                stderr,
            } => {
                assert_eq!(command, "fail");
                assert_eq!(exit_code, Some(3));
                assert_eq!(stdout, "partial\n");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error {:?}", other),
        }
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_commands() {
        let (port, node) = spawn_node("edge-1").await;
        let connection = test_manager()
            .connect_ssh(&CancellationToken::new(), local(port))
            .await
            .unwrap();

        connection.close().await.unwrap();
        connection.close().await.unwrap();

        let err = connection.execute("hostname").await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(ref host) if host == "127.0.0.1"));
        assert!(!connection.is_alive().await);
        assert!(node.commands().is_empty());
    }

    #[tokio::test]
    async fn test_silent_command_times_out() {
        let (port, _node) = spawn_node("edge-1").await;
        let mut config = local(port);
        config.command_timeout = Duration::from_secs(1);
        let connection = test_manager()
            .connect_ssh(&CancellationToken::new(), config)
            .await
            .unwrap();

        let start = std::time::Instant::now();
        let err = connection.execute("sleep").await.unwrap_err();
        assert!(matches!(err, Error::Timeout { seconds: 1 }));
        assert!(start.elapsed() < Duration::from_secs(5));

        // The connection stays usable after a timed-out command
        assert_eq!(connection.execute("hostname").await.unwrap(), "edge-1\n");
        connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_hop_through_bastion() {
        let (bastion_port, bastion) = spawn_node("bastion").await;
        let (target_port, target) = spawn_node("edge-2").await;

        let config = local(target_port).with_bastion(Some(BastionConfig {
            host: "127.0.0.1".to_string(),
            user: "jump".to_string(),
            port: bastion_port,
        }));
        let connection = test_manager()
            .connect_ssh(&CancellationToken::new(), config)
            .await
            .unwrap();

        assert_eq!(connection.execute("hostname").await.unwrap(), "edge-2\n");
        assert_eq!(connection.bastion_host(), Some("127.0.0.1"));

        assert_eq!(bastion.users(), vec!["jump"]);
        assert_eq!(bastion.tunnels(), vec![format!("127.0.0.1:{}", target_port)]);
        assert!(bastion.commands().is_empty());
        assert_eq!(target.users(), vec!["ubuntu"]);
        assert_eq!(target.commands(), vec!["hostname"]);

        connection.close().await.unwrap();
        assert!(matches!(
            connection.execute("hostname").await,
            Err(Error::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_target_behind_bastion() {
        let (bastion_port, bastion) = spawn_node("bastion").await;
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let target_port = closed.local_addr().unwrap().port();
        drop(closed);

        let config = local(target_port).with_bastion(Some(BastionConfig {
            host: "127.0.0.1".to_string(),
            user: "jump".to_string(),
            port: bastion_port,
        }));
        let err = test_manager()
            .connect_ssh(&CancellationToken::new(), config)
            .await
            .err()
            .expect("target is down");

        let Error::Retry(retry) = &err else {
            panic!("unexpected error {:?}", err);
        };
        assert!(
            matches!(retry.last_error(), Some(Error::Connection { hop: Hop::Target, .. })),
            "{:?}",
            err
        );
        assert_eq!(bastion.tunnels().len(), 1);
    }

    #[test]
    fn test_command_output_success() {
        let output = CommandOutput {
            stdout: "ok".to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        };
        assert!(output.success());

        let killed = CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
        };
        assert!(!killed.success());
    }

    #[test]
    fn test_rejects_garbage_key() {
        let result = ConnectionManager::from_pem("not a key");
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_first_line() {
        assert_eq!(first_line("bash -s <<'X'\necho hi\nX"), "bash -s <<'X'");
        assert_eq!(first_line(""), "");
    }

    #[tokio::test]
    async fn test_dead_bastion_fails_fast() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let key = russh_keys::key::KeyPair::generate_ed25519()
            .expect("ed25519 generation");
        let manager = ConnectionManager {
            key: Arc::new(key),
            retry: RetryPolicy::default().with_max_attempts(5),
        };

        let config = ConnectionConfig::new("10.0.0.9").with_bastion(Some(
            meshvpn_common::BastionConfig {
                host: "127.0.0.1".to_string(),
                user: "root".to_string(),
                port,
            },
        ));

        let start = std::time::Instant::now();
        let err = manager
            .connect_ssh(&CancellationToken::new(), config)
            .await
            .err()
            .expect("bastion is down");
        assert!(matches!(err, Error::Bastion { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
