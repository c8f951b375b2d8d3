//! wg-quick configuration files
//!
//! Parsing is strict enough to catch a corrupted rewrite before it is left on
//! a node. Editing works on text blocks so that comments, ordering and
//! unknown keys in the rest of the file survive untouched.

use meshvpn_common::{Error, PeerConfig, Result, WG_KEY_LEN};

/// One `[Interface]` or `[Peer]` section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    pub entries: Vec<(String, String)>,
}

impl Section {
    /// First value of a key, case-insensitive
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Comma-separated values across every occurrence of a key
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(key))
            .flat_map(|(_, v)| v.split(','))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect()
    }
}

/// Parsed wg-quick file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WgConfig {
    pub interface: Option<Section>,
    pub peers: Vec<Section>,
}

impl WgConfig {
    pub fn has_peer(&self, public_key: &str) -> bool {
        self.peers
            .iter()
            .any(|p| p.get("PublicKey") == Some(public_key))
    }

    pub fn peer_keys(&self) -> Vec<&str> {
        self.peers.iter().filter_map(|p| p.get("PublicKey")).collect()
    }

    /// `Address` of the interface section, if any
    pub fn address(&self) -> Option<&str> {
        self.interface.as_ref().and_then(|i| i.get("Address"))
    }
}

enum Current {
    None,
    Interface,
    Peer,
}

/// Parse and validate a wg-quick file
pub fn parse(content: &str) -> Result<WgConfig> {
    let mut config = WgConfig::default();
    let mut current = Current::None;

    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('[') {
            let name = line
                .strip_prefix('[')
                .and_then(|l| l.strip_suffix(']'))
                .ok_or_else(|| invalid(line_no, "malformed section header"))?;
            current = match name.trim().to_ascii_lowercase().as_str() {
                "interface" => {
                    if config.interface.is_some() {
                        return Err(invalid(line_no, "duplicate [Interface] section"));
                    }
                    config.interface = Some(Section::default());
                    Current::Interface
                }
                "peer" => {
                    config.peers.push(Section::default());
                    Current::Peer
                }
                other => return Err(invalid(line_no, &format!("unknown section [{}]", other))),
            };
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| invalid(line_no, "expected `Key = Value`"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(invalid(line_no, "empty key"));
        }
        let entry = (key.to_string(), value.trim().to_string());

        match current {
            Current::None => return Err(invalid(line_no, "key outside of any section")),
            Current::Interface => {
                if let Some(section) = config.interface.as_mut() {
                    section.entries.push(entry);
                }
            }
            Current::Peer => {
                if let Some(section) = config.peers.last_mut() {
                    section.entries.push(entry);
                }
            }
        }
    }

    for (i, peer) in config.peers.iter().enumerate() {
        match peer.get("PublicKey") {
            Some(key) if key.len() == WG_KEY_LEN => {}
            Some(key) => {
                return Err(Error::InvalidConfig(format!(
                    "peer #{} has a malformed public key ({} chars)",
                    i + 1,
                    key.len()
                )))
            }
            None => {
                return Err(Error::InvalidConfig(format!(
                    "peer #{} has no PublicKey",
                    i + 1
                )))
            }
        }
    }

    Ok(config)
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn invalid(line: usize, message: &str) -> Error {
    Error::InvalidConfig(format!("line {}: {}", line, message))
}

/// Render a `[Peer]` block
pub fn render_peer(peer: &PeerConfig) -> String {
    let mut out = String::from("[Peer]\n");
    if !peer.label.is_empty() {
        out.push_str(&format!("# {}\n", peer.label.replace('\n', " ")));
    }
    out.push_str(&format!("PublicKey = {}\n", peer.public_key));
    if let Some(psk) = &peer.preshared_key {
        out.push_str(&format!("PresharedKey = {}\n", psk));
    }
    out.push_str(&format!("AllowedIPs = {}\n", peer.allowed_ips.join(", ")));
    if let Some(endpoint) = &peer.endpoint {
        out.push_str(&format!("Endpoint = {}\n", endpoint));
    }
    if peer.keepalive > 0 {
        out.push_str(&format!("PersistentKeepalive = {}\n", peer.keepalive));
    }
    out
}

/// Render an `[Interface]` block
pub fn render_interface(address: &str, private_key: &str, listen_port: u16) -> String {
    format!(
        "[Interface]\nAddress = {}\nPrivateKey = {}\nListenPort = {}\n",
        address, private_key, listen_port
    )
}

/// Append a peer block, leaving the existing text as is
pub fn append_peer(content: &str, peer: &PeerConfig) -> String {
    let head = content.trim_end();
    if head.is_empty() {
        render_peer(peer)
    } else {
        format!("{}\n\n{}", head, render_peer(peer))
    }
}

/// Drop every `[Peer]` block for `public_key`.
///
/// Returns the new text and whether anything was removed.
pub fn remove_peer(content: &str, public_key: &str) -> (String, bool) {
    let mut blocks: Vec<Vec<&str>> = vec![Vec::new()];
    for line in content.lines() {
        if line.trim_start().starts_with('[') {
            blocks.push(Vec::new());
        }
        if let Some(block) = blocks.last_mut() {
            block.push(line);
        }
    }

    let before = blocks.len();
    blocks.retain(|block| !is_peer_block_for(block, public_key));
    let removed = blocks.len() != before;

    let mut out = blocks.concat().join("\n").trim_end().to_string();
    if !out.is_empty() {
        out.push('\n');
    }
    (out, removed)
}

fn is_peer_block_for(block: &[&str], public_key: &str) -> bool {
    let is_peer = block
        .first()
        .map(|l| l.trim().eq_ignore_ascii_case("[peer]"))
        .unwrap_or(false);
    is_peer
        && block.iter().skip(1).any(|line| {
            strip_comment(line)
                .split_once('=')
                .map(|(k, v)| k.trim().eq_ignore_ascii_case("PublicKey") && v.trim() == public_key)
                .unwrap_or(false)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";
    const KEY_B: &str = "TrMvSoP4jYQlY6RIzBgbssQqY3vxI2Pi+y71lOWWXX0=";

    fn sample() -> String {
        format!(
            "# managed by hand\n[Interface]\nAddress = 10.8.0.1/24\nPrivateKey = {priv}\nListenPort = 51820\nPostUp = iptables -A FORWARD -i %i -j ACCEPT\n\n[Peer]\n# laptop\nPublicKey = {a}\nAllowedIPs = 10.8.0.2/32\n\n[Peer]\nPublicKey = {b}\nAllowedIPs = 10.8.0.3/32, 192.168.10.0/24\nPersistentKeepalive = 25\n",
            priv = KEY_A,
            a = KEY_A,
            b = KEY_B
        )
    }

    #[test]
    fn test_parse_sections() {
        let cfg = parse(&sample()).unwrap();
        assert_eq!(cfg.address(), Some("10.8.0.1/24"));
        assert_eq!(cfg.peer_keys(), vec![KEY_A, KEY_B]);
        assert_eq!(
            cfg.peers[1].get_list("allowedips"),
            vec!["10.8.0.3/32", "192.168.10.0/24"]
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("[Interface]\nthis is not a key value\n").is_err());
        assert!(parse("Address = 10.8.0.1/24\n").is_err());
        assert!(parse("[Interface]\n[Interface]\n").is_err());
        assert!(parse("[Tunnel]\n").is_err());
        assert!(parse("[Peer]\nAllowedIPs = 10.8.0.2/32\n").is_err());
        assert!(parse("[Peer]\nPublicKey = short\n").is_err());
    }

    #[test]
    fn test_append_then_remove_restores_text() {
        let original = sample();
        let mut peer = PeerConfig::new(
            "Zm9vYmFyYmF6cXV4Zm9vYmFyYmF6cXV4Zm9vYmFyYmE=",
            vec!["10.8.0.4/32".to_string()],
        );
        peer.label = "ci-runner".to_string();
        peer.keepalive = 25;

        let appended = append_peer(&original, &peer);
        let parsed = parse(&appended).unwrap();
        assert!(parsed.has_peer(&peer.public_key));
        assert!(appended.contains("# ci-runner\n"));
        assert!(appended.contains("PersistentKeepalive = 25"));

        let (removed, changed) = remove_peer(&appended, &peer.public_key);
        assert!(changed);
        assert_eq!(removed, original);
    }

    #[test]
    fn test_remove_keeps_other_blocks() {
        let (out, changed) = remove_peer(&sample(), KEY_A);
        assert!(changed);
        let cfg = parse(&out).unwrap();
        assert_eq!(cfg.peer_keys(), vec![KEY_B]);
        assert!(out.contains("PostUp = iptables"));
        assert!(out.starts_with("# managed by hand\n"));
    }

    #[test]
    fn test_remove_missing_peer_is_noop() {
        let (_, changed) = remove_peer(&sample(), "bm9wZW5vcGVub3Blbm9wZW5vcGVub3Blbm9wZW5vcGU=");
        assert!(!changed);
    }

    #[test]
    fn test_append_to_empty_file() {
        let peer = PeerConfig::new(KEY_B, vec!["10.8.0.9/32".to_string()]);
        let out = append_peer("", &peer);
        assert!(out.starts_with("[Peer]\n"));
        assert!(parse(&out).unwrap().has_peer(KEY_B));
    }
}
