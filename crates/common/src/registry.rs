//! Durable peer registry
//!
//! One JSON document per stack under an owner-only data directory:
//!
//! ```text
//! <root>/
//!   production.json   [RegisteredPeer, ...]
//!   staging.json
//! ```
//!
//! Stacks are loaded lazily on first access and cached in a two-level map
//! (stack -> public key -> peer). A single mutex guards every stack. Each
//! mutation rewrites the whole stack file through a temp file and rename.

use crate::types::RegisteredPeer;
use crate::{Error, Result};
use chrono::Utc;
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

type PeerMap = HashMap<String, RegisteredPeer>;

/// Registry of admitted peers, partitioned by stack
#[derive(Debug)]
pub struct PeerRegistry {
    root: PathBuf,
    stacks: Mutex<HashMap<String, PeerMap>>,
}

impl PeerRegistry {
    /// Open (and create if needed) a registry rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&root, fs::Permissions::from_mode(0o700))?;
        }

        debug!("Opened peer registry at {:?}", root);

        Ok(Self {
            root,
            stacks: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory of the registry
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a stack's JSON document
    pub fn stack_path(&self, stack: &str) -> Result<PathBuf> {
        validate_stack_name(stack)?;
        Ok(self.root.join(format!("{}.json", stack)))
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Insert or update a peer by public key.
    ///
    /// An update keeps the original `added_at`; `last_seen` is always refreshed.
    pub fn register(&self, stack: &str, mut peer: RegisteredPeer) -> Result<RegisteredPeer> {
        if peer.public_key.is_empty() {
            return Err(Error::InvalidPeerConfig("public key is empty".to_string()));
        }

        self.mutate(stack, |peers| {
            let now = Utc::now();
            if let Some(existing) = peers.get(&peer.public_key) {
                peer.added_at = existing.added_at;
            } else {
                peer.added_at = now;
            }
            peer.last_seen = now;
            peers.insert(peer.public_key.clone(), peer.clone());
        })?;

        info!("Registered peer {} ({}) in stack {}", peer.public_key, peer.vpn_ip, stack);
        Ok(peer)
    }

    /// Remove a peer by public key. Missing keys are a no-op.
    pub fn unregister(&self, stack: &str, public_key: &str) -> Result<bool> {
        let mut removed = false;
        self.mutate(stack, |peers| {
            removed = peers.remove(public_key).is_some();
        })?;

        if removed {
            info!("Unregistered peer {} from stack {}", public_key, stack);
        }
        Ok(removed)
    }

    /// Drop every peer of a stack
    pub fn clear(&self, stack: &str) -> Result<()> {
        self.mutate(stack, |peers| peers.clear())?;
        info!("Cleared stack {}", stack);
        Ok(())
    }

    /// Replace a stack's peers with a JSON array previously produced by `export`
    pub fn import(&self, stack: &str, json: &str) -> Result<usize> {
        let imported: Vec<RegisteredPeer> = serde_json::from_str(json)?;
        if let Some(bad) = imported.iter().find(|p| p.public_key.is_empty()) {
            return Err(Error::InvalidPeerConfig(format!(
                "imported peer {} has an empty public key",
                bad.vpn_ip
            )));
        }

        let count = imported.len();
        self.mutate(stack, |peers| {
            peers.clear();
            for peer in imported {
                peers.insert(peer.public_key.clone(), peer);
            }
        })?;

        info!("Imported {} peers into stack {}", count, stack);
        Ok(count)
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Look up a peer by public key
    pub fn get(&self, stack: &str, public_key: &str) -> Result<Option<RegisteredPeer>> {
        self.read(stack, |peers| peers.get(public_key).cloned())
    }

    /// First peer carrying `label` (most recently seen wins)
    pub fn get_by_label(&self, stack: &str, label: &str) -> Result<RegisteredPeer> {
        self.find(stack, "label", label, |p| p.label == label)
    }

    /// Peer holding `ip`
    pub fn get_by_ip(&self, stack: &str, ip: IpAddr) -> Result<RegisteredPeer> {
        self.find(stack, "ip", &ip.to_string(), |p| p.vpn_ip == ip)
    }

    /// First peer registered for `machine` (most recently seen wins)
    pub fn get_by_machine(&self, stack: &str, machine: &str) -> Result<RegisteredPeer> {
        self.find(stack, "machine", machine, |p| p.machine_name == machine)
    }

    /// True if any peer matches `needle` by key, label, IP or machine name
    pub fn exists(&self, stack: &str, needle: &str) -> Result<bool> {
        self.read(stack, |peers| {
            peers.values().any(|p| {
                p.public_key == needle
                    || (!p.label.is_empty() && p.label == needle)
                    || (!p.machine_name.is_empty() && p.machine_name == needle)
                    || p.vpn_ip.to_string() == needle
            })
        })
    }

    /// All peers of a stack, ordered by VPN IP
    pub fn list(&self, stack: &str) -> Result<Vec<RegisteredPeer>> {
        self.read(stack, sorted_peers)
    }

    /// Pretty JSON array of a stack's peers
    pub fn export(&self, stack: &str) -> Result<String> {
        let peers = self.list(stack)?;
        Ok(serde_json::to_string_pretty(&peers)?)
    }

    /// Stacks with a document on disk
    pub fn stacks(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    // ========================================================================
    // IP allocation
    // ========================================================================

    /// First free address of `subnet`, starting at network + 2.
    ///
    /// The network address and the assumed gateway (network + 1) are never
    /// handed out, nor is any reserved or already registered address.
    pub fn next_available_ip(&self, stack: &str, subnet: &str, reserved: &[IpAddr]) -> Result<IpAddr> {
        let network: IpNetwork = subnet
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("invalid subnet {}: {}", subnet, e)))?;

        let mut excluded: HashSet<IpAddr> = reserved.iter().copied().collect();
        self.read(stack, |peers| excluded.extend(peers.values().map(|p| p.vpn_ip)))?;

        let exhausted = || Error::SubnetExhausted {
            subnet: subnet.to_string(),
        };

        let mut candidate = next_ip(network.network())
            .and_then(next_ip)
            .ok_or_else(exhausted)?;

        loop {
            if !network.contains(candidate) {
                return Err(exhausted());
            }
            if !excluded.contains(&candidate) {
                debug!("Allocated {} from {} in stack {}", candidate, subnet, stack);
                return Ok(candidate);
            }
            candidate = next_ip(candidate).ok_or_else(exhausted)?;
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn read<T>(&self, stack: &str, f: impl FnOnce(&PeerMap) -> T) -> Result<T> {
        let mut stacks = self.stacks.lock();
        let peers = self.load_locked(&mut stacks, stack)?;
        Ok(f(peers))
    }

    fn find(
        &self,
        stack: &str,
        field: &str,
        value: &str,
        pred: impl Fn(&RegisteredPeer) -> bool,
    ) -> Result<RegisteredPeer> {
        self.read(stack, |peers| {
            peers
                .values()
                .filter(|p| pred(*p))
                .max_by_key(|p| p.last_seen)
                .cloned()
        })?
        .ok_or_else(|| Error::not_found(format!("peer ({})", field), value))
    }

    /// Apply `f` to a copy of the stack, write it out, then swap it in
    fn mutate(&self, stack: &str, f: impl FnOnce(&mut PeerMap)) -> Result<()> {
        let path = self.stack_path(stack)?;
        let mut stacks = self.stacks.lock();
        let current = self.load_locked(&mut stacks, stack)?;

        let mut updated = current.clone();
        f(&mut updated);
        write_stack_file(&path, &updated)?;

        *current = updated;
        Ok(())
    }

    fn load_locked<'a>(
        &self,
        stacks: &'a mut HashMap<String, PeerMap>,
        stack: &str,
    ) -> Result<&'a mut PeerMap> {
        if !stacks.contains_key(stack) {
            let path = self.stack_path(stack)?;
            let peers = read_stack_file(&path)?;
            debug!("Loaded {} peers for stack {}", peers.len(), stack);
            stacks.insert(stack.to_string(), peers);
        }
        stacks
            .get_mut(stack)
            .ok_or_else(|| Error::Internal(format!("stack {} vanished from cache", stack)))
    }
}

fn sorted_peers(peers: &PeerMap) -> Vec<RegisteredPeer> {
    let mut list: Vec<RegisteredPeer> = peers.values().cloned().collect();
    list.sort_by(|a, b| a.vpn_ip.cmp(&b.vpn_ip).then_with(|| a.public_key.cmp(&b.public_key)));
    list
}

fn read_stack_file(path: &Path) -> Result<PeerMap> {
    if !path.exists() {
        return Ok(PeerMap::new());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(PeerMap::new());
    }
    let list: Vec<RegisteredPeer> = serde_json::from_str(&content)?;
    Ok(list.into_iter().map(|p| (p.public_key.clone(), p)).collect())
}

fn write_stack_file(path: &Path, peers: &PeerMap) -> Result<()> {
    let data = serde_json::to_vec_pretty(&sorted_peers(peers))?;
    let tmp_path = path.with_extension("json.tmp");

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let write = || -> std::io::Result<()> {
        let mut file = options.open(&tmp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        Error::Persistence(format!("failed to write {}: {}", path.display(), e))
    })
}

fn validate_stack_name(stack: &str) -> Result<()> {
    let valid = !stack.is_empty()
        && !stack.starts_with('.')
        && stack
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!("invalid stack name: {:?}", stack)))
    }
}

/// Big-endian increment with carry; None on overflow
pub fn next_ip(ip: IpAddr) -> Option<IpAddr> {
    match ip {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            increment(&mut octets).then(|| IpAddr::from(octets))
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            increment(&mut octets).then(|| IpAddr::from(octets))
        }
    }
}

fn increment(octets: &mut [u8]) -> bool {
    for byte in octets.iter_mut().rev() {
        if *byte == u8::MAX {
            *byte = 0;
        } else {
            *byte += 1;
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STACK: &str = "dev";

    fn key(n: u8) -> String {
        let mut k = format!("{:0>43}", n);
        k.push('=');
        k
    }

    fn open() -> (TempDir, PeerRegistry) {
        let dir = TempDir::new().unwrap();
        let registry = PeerRegistry::open(dir.path().join("peers")).unwrap();
        (dir, registry)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_empty_registry_allocates_network_plus_two() {
        let (_dir, registry) = open();
        assert_eq!(registry.next_available_ip(STACK, "10.8.0.0/24", &[]).unwrap(), ip("10.8.0.2"));
        assert_eq!(registry.next_available_ip(STACK, "172.16.4.0/22", &[]).unwrap(), ip("172.16.4.2"));
        assert_eq!(registry.next_available_ip(STACK, "fd00::/64", &[]).unwrap(), ip("fd00::2"));
    }

    #[test]
    fn test_allocation_is_stable_until_registered() {
        let (_dir, registry) = open();
        let first = registry.next_available_ip(STACK, "10.8.0.0/24", &[]).unwrap();
        let second = registry.next_available_ip(STACK, "10.8.0.0/24", &[]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_sequential_allocation_skips_reserved() {
        let (_dir, registry) = open();
        let reserved = [ip("10.8.0.3"), ip("10.8.0.5")];
        let mut allocated = Vec::new();

        for n in 0..4 {
            let next = registry.next_available_ip(STACK, "10.8.0.0/24", &reserved).unwrap();
            registry.register(STACK, RegisteredPeer::new(key(n), next)).unwrap();
            allocated.push(next);
        }

        assert_eq!(
            allocated,
            vec![ip("10.8.0.2"), ip("10.8.0.4"), ip("10.8.0.6"), ip("10.8.0.7")]
        );
    }

    #[test]
    fn test_allocation_carries_across_octets() {
        let (_dir, registry) = open();
        let reserved: Vec<IpAddr> = (2..=255).map(|h| IpAddr::from([10, 8, 0, h])).collect();
        let next = registry.next_available_ip(STACK, "10.8.0.0/23", &reserved).unwrap();
        assert_eq!(next, ip("10.8.1.0"));
    }

    #[test]
    fn test_subnet_exhaustion() {
        let (_dir, registry) = open();
        let reserved = [ip("10.8.0.2"), ip("10.8.0.3")];
        let err = registry.next_available_ip(STACK, "10.8.0.0/30", &reserved).unwrap_err();
        assert!(matches!(err, Error::SubnetExhausted { .. }));

        let err = registry.next_available_ip(STACK, "10.8.0.7/32", &[]).unwrap_err();
        assert!(matches!(err, Error::SubnetExhausted { .. }));
    }

    #[test]
    fn test_invalid_subnet() {
        let (_dir, registry) = open();
        let err = registry.next_available_ip(STACK, "not-a-subnet", &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_register_lookup_unregister_by_label() {
        let (_dir, registry) = open();
        let mut peer = RegisteredPeer::new(key(1), ip("10.8.0.2"));
        peer.label = "X".to_string();
        registry.register(STACK, peer).unwrap();

        let found = registry.get_by_label(STACK, "X").unwrap();
        assert_eq!(found.public_key, key(1));
        assert_eq!(found.vpn_ip, ip("10.8.0.2"));

        assert!(registry.unregister(STACK, &key(1)).unwrap());
        assert!(matches!(
            registry.get_by_label(STACK, "X"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_unregister_missing_is_noop() {
        let (_dir, registry) = open();
        assert!(!registry.unregister(STACK, &key(9)).unwrap());
    }

    #[test]
    fn test_update_preserves_added_at() {
        let (_dir, registry) = open();
        let first = registry.register(STACK, RegisteredPeer::new(key(1), ip("10.8.0.2"))).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut update = RegisteredPeer::new(key(1), ip("10.8.0.2"));
        update.label = "laptop".to_string();
        let second = registry.register(STACK, update).unwrap();

        assert_eq!(second.added_at, first.added_at);
        assert!(second.last_seen > first.last_seen);
        assert_eq!(registry.get(STACK, &key(1)).unwrap().unwrap().label, "laptop");
    }

    #[test]
    fn test_secondary_lookups_and_exists() {
        let (_dir, registry) = open();
        let mut peer = RegisteredPeer::new(key(1), ip("10.8.0.9"));
        peer.label = "ci-runner".to_string();
        peer.machine_name = "build-01".to_string();
        registry.register(STACK, peer).unwrap();

        assert_eq!(registry.get_by_ip(STACK, ip("10.8.0.9")).unwrap().public_key, key(1));
        assert_eq!(registry.get_by_machine(STACK, "build-01").unwrap().public_key, key(1));
        assert!(registry.exists(STACK, "ci-runner").unwrap());
        assert!(registry.exists(STACK, "10.8.0.9").unwrap());
        assert!(registry.exists(STACK, &key(1)).unwrap());
        assert!(!registry.exists(STACK, "nobody").unwrap());
    }

    #[test]
    fn test_stacks_are_isolated() {
        let (_dir, registry) = open();
        registry.register("a", RegisteredPeer::new(key(1), ip("10.8.0.2"))).unwrap();

        assert!(registry.get("b", &key(1)).unwrap().is_none());
        assert_eq!(registry.next_available_ip("b", "10.8.0.0/24", &[]).unwrap(), ip("10.8.0.2"));
        assert_eq!(registry.next_available_ip("a", "10.8.0.0/24", &[]).unwrap(), ip("10.8.0.3"));
        assert_eq!(registry.stacks().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let registry = PeerRegistry::open(dir.path()).unwrap();
            registry.register(STACK, RegisteredPeer::new(key(1), ip("10.8.0.2"))).unwrap();
        }
        let registry = PeerRegistry::open(dir.path()).unwrap();
        assert_eq!(registry.list(STACK).unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, registry) = open();
        registry.register(STACK, RegisteredPeer::new(key(1), ip("10.8.0.2"))).unwrap();

        let dir_mode = fs::metadata(registry.root()).unwrap().permissions().mode();
        let file_mode = fs::metadata(registry.stack_path(STACK).unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[test]
    fn test_rejects_path_like_stack_names() {
        let (_dir, registry) = open();
        assert!(registry.list("../etc").is_err());
        assert!(registry.list("").is_err());
        assert!(registry.list("a/b").is_err());
    }

    #[test]
    fn test_next_ip_overflow() {
        assert_eq!(next_ip(ip("255.255.255.255")), None);
        assert_eq!(next_ip(ip("10.0.0.255")), Some(ip("10.0.1.0")));
    }
}
