//! In-memory fleet for exercising the mesh layer without SSH
//!
//! [`SimulatedFleet`] implements [`Connector`] and [`HealthChecker`]; each
//! [`SimulatedHost`] interprets the shell commands the config manager and
//! providers issue (`wg`, `wg-quick`, `cat`, `tee`, `cp`, `mv`, ...) against
//! a fake interface and file system.

use crate::wgconf;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use meshvpn_common::{
    generate_keypair, ConnectionConfig, Error, Hop, NodeInfo, PeerConfig, Result,
};
use meshvpn_remote::{Connector, HealthChecker, HealthReport, RemoteSession, SshHealthChecker};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Interface every simulated host carries
pub const SIM_INTERFACE: &str = "wg0";

/// Config file of [`SIM_INTERFACE`]
pub const SIM_CONFIG_PATH: &str = "/etc/wireguard/wg0.conf";

#[derive(Debug, Clone, Default)]
struct SimPeer {
    allowed_ips: Vec<String>,
    endpoint: Option<String>,
    keepalive: u32,
    preshared_key: Option<String>,
}

#[derive(Debug, Default)]
struct HostState {
    reachable: bool,
    up: bool,
    runtime: BTreeMap<String, SimPeer>,
    files: HashMap<String, String>,
    commands: Vec<String>,
    scripts: Vec<String>,
    failing: Vec<String>,
    stubs: Vec<(String, String)>,
    corrupt_writes: bool,
    users: Vec<String>,
    opened: usize,
    closed: usize,
}

/// One fake node
#[derive(Debug)]
pub struct SimulatedHost {
    address: String,
    private_key: String,
    public_key: String,
    state: Mutex<HostState>,
}

impl SimulatedHost {
    fn new(address: &str) -> Self {
        let keys = generate_keypair();
        Self {
            address: address.to_string(),
            private_key: keys.private_key,
            public_key: keys.public_key,
            state: Mutex::new(HostState {
                reachable: true,
                ..Default::default()
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Interface public key
    pub fn public_key(&self) -> String {
        self.public_key.clone()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    pub fn is_reachable(&self) -> bool {
        self.state.lock().reachable
    }

    /// Any command containing `pattern` exits 1
    pub fn fail_commands_containing(&self, pattern: &str) {
        self.state.lock().failing.push(pattern.to_string());
    }

    /// Commands starting with `prefix` print `output` and succeed
    pub fn respond(&self, prefix: &str, output: &str) {
        self.state
            .lock()
            .stubs
            .push((prefix.to_string(), output.to_string()));
    }

    /// `tee` writes garbage instead of its input
    pub fn corrupt_writes(&self, corrupt: bool) {
        self.state.lock().corrupt_writes = corrupt;
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn commands_matching(&self, needle: &str) -> Vec<String> {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.contains(needle))
            .cloned()
            .collect()
    }

    /// Scripts delivered through `bash -s`
    pub fn scripts(&self) -> Vec<String> {
        self.state.lock().scripts.clone()
    }

    /// SSH users of every accepted connection
    pub fn login_users(&self) -> Vec<String> {
        self.state.lock().users.clone()
    }

    /// Sessions opened and not yet closed
    pub fn open_sessions(&self) -> usize {
        let state = self.state.lock();
        state.opened - state.closed
    }

    pub fn runtime_peers(&self) -> Vec<String> {
        self.state.lock().runtime.keys().cloned().collect()
    }

    pub fn has_runtime_peer(&self, public_key: &str) -> bool {
        self.state.lock().runtime.contains_key(public_key)
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state.lock().files.get(path).cloned()
    }

    /// Content of the interface config file, empty if missing
    pub fn config_file(&self) -> String {
        self.file(SIM_CONFIG_PATH).unwrap_or_default()
    }

    pub fn set_file(&self, path: &str, content: &str) {
        self.state
            .lock()
            .files
            .insert(path.to_string(), content.to_string());
    }

    /// Bring the interface up with a fresh config file
    fn provision(&self, address: &str) {
        let mut state = self.state.lock();
        state.files.insert(
            SIM_CONFIG_PATH.to_string(),
            wgconf::render_interface(address, &self.private_key, 51820),
        );
        state.up = true;
    }

    /// Run one command line
    pub fn run(&self, command: &str) -> Result<String> {
        let mut state = self.state.lock();
        state.commands.push(command.to_string());

        if state.failing.iter().any(|p| command.contains(p.as_str())) {
            return Err(failure(command, 1, "simulated failure"));
        }
        if let Some((_, output)) = state.stubs.iter().find(|(p, _)| command.starts_with(p.as_str())) {
            return Ok(output.clone());
        }
        if command.starts_with("bash -s <<") {
            state.scripts.push(command.to_string());
            return Ok(String::new());
        }

        let mut output = String::new();
        for step in command.split(" && ") {
            let mut stdin = Vec::new();
            for segment in step.split(" | ") {
                stdin = self.exec(&mut state, segment, stdin)?;
            }
            output = String::from_utf8_lossy(&stdin).into_owned();
        }
        Ok(output)
    }

    fn exec(&self, state: &mut HostState, segment: &str, stdin: Vec<u8>) -> Result<Vec<u8>> {
        let mut words = split_words(segment);
        let discard = match words.iter().position(|w| w == ">") {
            Some(pos) => {
                words.truncate(pos);
                true
            }
            None => false,
        };
        if words.first().map(String::as_str) == Some("sudo") {
            words.remove(0);
        }
        let args: Vec<&str> = words.iter().map(String::as_str).collect();

        let out: Vec<u8> = match args.as_slice() {
            ["true"] => Vec::new(),
            ["echo", rest @ ..] => format!("{}\n", rest.join(" ")).into_bytes(),
            ["printf", "%s", data] => data.as_bytes().to_vec(),
            ["base64", "-d"] => {
                let text = String::from_utf8_lossy(&stdin);
                BASE64
                    .decode(text.trim())
                    .map_err(|e| failure(segment, 1, &e.to_string()))?
            }
            ["tee", path] => {
                let content = if state.corrupt_writes {
                    "[Peer]\nthis line is not valid\n".to_string()
                } else {
                    String::from_utf8_lossy(&stdin).into_owned()
                };
                state.files.insert(path.to_string(), content);
                stdin
            }
            ["chmod", _, path] => {
                require_file(state, segment, path)?;
                Vec::new()
            }
            ["mv", from, to] => {
                let content = state
                    .files
                    .remove(*from)
                    .ok_or_else(|| failure(segment, 1, "No such file or directory"))?;
                state.files.insert(to.to_string(), content);
                Vec::new()
            }
            ["cp", "-p", from, to] => {
                let content = require_file(state, segment, from)?;
                state.files.insert(to.to_string(), content);
                Vec::new()
            }
            ["cat", path] => require_file(state, segment, path)?.into_bytes(),
            ["test", "-f", path] => {
                require_file(state, segment, path)?;
                Vec::new()
            }
            ["wg", "genkey"] => format!("{}\n", generate_keypair().private_key).into_bytes(),
            ["wg", "show", iface] => {
                self.check_iface(state, segment, iface)?;
                format!("interface: {}\n", iface).into_bytes()
            }
            ["wg", "show", iface, what] => {
                self.check_iface(state, segment, iface)?;
                self.show(state, segment, what)?.into_bytes()
            }
            ["wg", "set", iface, "peer", key, "remove"] => {
                self.check_iface(state, segment, iface)?;
                state.runtime.remove(*key);
                Vec::new()
            }
            ["wg", "set", iface, "peer", key, rest @ ..] => {
                self.check_iface(state, segment, iface)?;
                let mut peer = state.runtime.get(*key).cloned().unwrap_or_default();
                for pair in rest.chunks(2) {
                    match pair {
                        ["allowed-ips", ips] => {
                            peer.allowed_ips = ips.split(',').map(str::to_string).collect()
                        }
                        ["endpoint", endpoint] => peer.endpoint = Some(endpoint.to_string()),
                        ["persistent-keepalive", "off"] => peer.keepalive = 0,
                        ["persistent-keepalive", secs] => {
                            peer.keepalive = secs
                                .parse()
                                .map_err(|_| failure(segment, 1, "invalid keepalive"))?
                        }
                        ["preshared-key", "/dev/stdin"] => {
                            peer.preshared_key =
                                Some(String::from_utf8_lossy(&stdin).trim().to_string())
                        }
                        _ => return Err(failure(segment, 1, "Invalid argument")),
                    }
                }
                state.runtime.insert(key.to_string(), peer);
                Vec::new()
            }
            ["wg-quick", "save", iface] => {
                self.check_iface(state, segment, iface)?;
                let current = require_file(state, segment, SIM_CONFIG_PATH)?;
                let saved = render_runtime(&current, &state.runtime);
                state.files.insert(SIM_CONFIG_PATH.to_string(), saved);
                Vec::new()
            }
            ["wg-quick", "up", iface] => {
                if *iface != SIM_INTERFACE {
                    return Err(failure(segment, 1, "no config file"));
                }
                if state.up {
                    return Err(failure(segment, 1, "wg-quick: `wg0' already exists"));
                }
                state.runtime = load_runtime(state, segment)?;
                state.up = true;
                Vec::new()
            }
            ["bash", "-c", inner] if inner.starts_with("wg syncconf ") => {
                let iface = inner.split_whitespace().nth(2).unwrap_or_default();
                self.check_iface(state, segment, iface)?;
                state.runtime = load_runtime(state, segment)?;
                Vec::new()
            }
            _ => return Err(failure(segment, 127, "command not found")),
        };

        Ok(if discard { Vec::new() } else { out })
    }

    fn check_iface(&self, state: &HostState, segment: &str, iface: &str) -> Result<()> {
        if iface != SIM_INTERFACE || !state.up {
            return Err(failure(
                segment,
                1,
                &format!("Unable to access interface {}: No such device", iface),
            ));
        }
        Ok(())
    }

    fn show(&self, state: &HostState, segment: &str, what: &str) -> Result<String> {
        let out = match what {
            "peers" => state
                .runtime
                .keys()
                .map(|k| format!("{}\n", k))
                .collect(),
            "public-key" => format!("{}\n", self.public_key),
            "listen-port" => "51820\n".to_string(),
            "dump" => {
                let mut out = format!("{}\t{}\t51820\toff\n", self.private_key, self.public_key);
                for (key, peer) in &state.runtime {
                    let or_none = |v: Option<&String>| v.cloned().unwrap_or_else(|| "(none)".to_string());
                    let ips = if peer.allowed_ips.is_empty() {
                        "(none)".to_string()
                    } else {
                        peer.allowed_ips.join(",")
                    };
                    let keepalive = if peer.keepalive == 0 {
                        "off".to_string()
                    } else {
                        peer.keepalive.to_string()
                    };
                    out.push_str(&format!(
                        "{}\t{}\t{}\t{}\t0\t0\t0\t{}\n",
                        key,
                        or_none(peer.preshared_key.as_ref()),
                        or_none(peer.endpoint.as_ref()),
                        ips,
                        keepalive
                    ));
                }
                out
            }
            _ => return Err(failure(segment, 1, "Invalid subcommand")),
        };
        Ok(out)
    }
}

fn failure(command: &str, code: u32, stderr: &str) -> Error {
    Error::CommandFailed {
        command: command.to_string(),
        exit_code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn require_file(state: &HostState, segment: &str, path: &str) -> Result<String> {
    state
        .files
        .get(path)
        .cloned()
        .ok_or_else(|| failure(segment, 1, &format!("{}: No such file or directory", path)))
}

fn load_runtime(state: &HostState, segment: &str) -> Result<BTreeMap<String, SimPeer>> {
    let content = require_file(state, segment, SIM_CONFIG_PATH)?;
    let parsed = wgconf::parse(&content).map_err(|e| failure(segment, 1, &e.to_string()))?;
    Ok(parsed
        .peers
        .iter()
        .filter_map(|section| {
            let key = section.get("PublicKey")?.to_string();
            let peer = SimPeer {
                allowed_ips: section.get_list("AllowedIPs"),
                endpoint: section.get("Endpoint").map(str::to_string),
                keepalive: section
                    .get("PersistentKeepalive")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                preshared_key: section.get("PresharedKey").map(str::to_string),
            };
            Some((key, peer))
        })
        .collect())
}

/// `wg-quick save`: keep the interface block, rewrite every peer from runtime
fn render_runtime(current: &str, runtime: &BTreeMap<String, SimPeer>) -> String {
    let interface: Vec<&str> = current
        .lines()
        .take_while(|l| !l.trim().eq_ignore_ascii_case("[peer]"))
        .collect();
    let mut out = interface.join("\n");
    for (key, peer) in runtime {
        let config = PeerConfig {
            public_key: key.clone(),
            allowed_ips: peer.allowed_ips.clone(),
            endpoint: peer.endpoint.clone(),
            keepalive: peer.keepalive,
            label: String::new(),
            preshared_key: peer.preshared_key.clone(),
        };
        out = wgconf::append_peer(&out, &config);
    }
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Split a command line into words, honouring shell quoting
pub fn split_words(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    current.push(c);
                }
            }
            '"' => {
                in_word = true;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => {
                            if let Some(next) = chars.next() {
                                current.push(next);
                            }
                        }
                        c => current.push(c),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Session handed out by [`SimulatedFleet`]
pub struct SimulatedSession {
    host: Arc<SimulatedHost>,
    closed: AtomicBool,
}

#[async_trait]
impl RemoteSession for SimulatedSession {
    fn host(&self) -> &str {
        &self.host.address
    }

    async fn execute(&self, command: &str) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed(self.host.address.clone()));
        }
        self.host.run(command)
    }

    async fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.host.is_reachable()
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.host.state.lock().closed += 1;
        }
        Ok(())
    }
}

/// A set of fake nodes addressed by host
#[derive(Debug, Default)]
pub struct SimulatedFleet {
    hosts: Mutex<HashMap<String, Arc<SimulatedHost>>>,
    attempts: Mutex<Vec<String>>,
}

impl SimulatedFleet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a node with wg0 up at 10.8.0.1/24 and no peers
    pub fn add_host(&self, address: &str) -> Arc<SimulatedHost> {
        let host = self.add_bare_host(address);
        host.provision("10.8.0.1/24");
        host
    }

    /// Add a node without any WireGuard configuration
    pub fn add_bare_host(&self, address: &str) -> Arc<SimulatedHost> {
        let host = Arc::new(SimulatedHost::new(address));
        self.hosts.lock().insert(address.to_string(), host.clone());
        host
    }

    pub fn host(&self, address: &str) -> Option<Arc<SimulatedHost>> {
        self.hosts.lock().get(address).cloned()
    }

    /// Add one provisioned host per node, returning the node descriptors
    pub fn add_nodes(&self, count: usize, provider: &str) -> Vec<NodeInfo> {
        (1..=count)
            .map(|i| {
                let address = format!("198.51.100.{}", i);
                self.add_host(&address);
                NodeInfo::new(format!("node-{}", i), address, provider)
            })
            .collect()
    }

    /// Hosts of every connection attempt, in order
    pub fn connection_attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }

    fn reachable(&self, address: &str) -> Option<Arc<SimulatedHost>> {
        self.host(address).filter(|h| h.is_reachable())
    }
}

#[async_trait]
impl Connector for SimulatedFleet {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        config: ConnectionConfig,
    ) -> Result<Arc<dyn RemoteSession>> {
        let config = config.with_defaults();
        self.attempts.lock().push(config.host.clone());

        if cancel.is_cancelled() {
            return Err(Error::Connection {
                hop: Hop::Target,
                host: config.host,
                message: "connect cancelled".to_string(),
            });
        }

        if let Some(bastion) = &config.bastion {
            if self.reachable(&bastion.host).is_none() {
                return Err(Error::Bastion {
                    host: bastion.host.clone(),
                    message: "connection refused".to_string(),
                });
            }
        }

        let host = self.reachable(&config.host).ok_or_else(|| Error::Connection {
            hop: Hop::Target,
            host: config.host.clone(),
            message: "connection refused".to_string(),
        })?;

        {
            let mut state = host.state.lock();
            state.users.push(config.user.clone());
            state.opened += 1;
        }

        Ok(Arc::new(SimulatedSession {
            host,
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl HealthChecker for SimulatedFleet {
    async fn check_bastion(&self, _cancel: &CancellationToken, host: &str, _port: u16) -> Result<()> {
        self.reachable(host).map(|_| ()).ok_or_else(|| Error::Bastion {
            host: host.to_string(),
            message: "connection refused".to_string(),
        })
    }

    async fn check_multiple_nodes(
        &self,
        cancel: &CancellationToken,
        nodes: &[NodeInfo],
        connector: &dyn Connector,
        base: &ConnectionConfig,
    ) -> HealthReport {
        SshHealthChecker::default()
            .check_multiple_nodes(cancel, nodes, connector, base)
            .await
    }
}
