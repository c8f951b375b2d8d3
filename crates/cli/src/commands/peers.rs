//! Peer registry commands

use anyhow::{Context, Result};
use clap::Subcommand;
use meshvpn_common::RegisteredPeer;
use serde::Serialize;
use std::path::PathBuf;

use crate::context::MeshContext;
use crate::output::{print_info, print_item, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum PeerCommands {
    /// List registered peers of the stack
    List,

    /// Show one peer by key, label, machine or VPN address
    Get {
        needle: String,
    },

    /// Write the stack's peers as JSON
    Export {
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Replace the stack's peers with a JSON export
    Import {
        file: PathBuf,
    },

    /// Remove every peer from the stack registry
    Clear {
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },

    /// List stacks with a registry file
    Stacks,
}

/// Registered peer display wrapper
#[derive(Serialize)]
pub struct PeerDisplay {
    pub public_key: String,
    pub vpn_ip: String,
    pub label: String,
    pub machine: String,
    pub added_at: String,
    pub last_seen: String,
}

impl From<RegisteredPeer> for PeerDisplay {
    fn from(peer: RegisteredPeer) -> Self {
        Self {
            public_key: peer.public_key,
            vpn_ip: peer.vpn_ip.to_string(),
            label: peer.label,
            machine: peer.machine_name,
            added_at: peer.added_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            last_seen: peer.last_seen.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

impl TableDisplay for PeerDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Public Key", "VPN IP", "Label", "Machine", "Added", "Last Seen"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.public_key.clone(),
            self.vpn_ip.clone(),
            self.label.clone(),
            self.machine.clone(),
            self.added_at.clone(),
            self.last_seen.clone(),
        ]
    }
}

/// Look a peer up by any of its identifiers
pub fn find_peer(ctx: &MeshContext, needle: &str) -> Result<RegisteredPeer> {
    let registry = ctx.registry();
    let stack = ctx.stack();

    if let Some(peer) = registry.get(stack, needle)? {
        return Ok(peer);
    }
    if let Ok(ip) = needle.parse() {
        if let Ok(peer) = registry.get_by_ip(stack, ip) {
            return Ok(peer);
        }
    }
    registry
        .get_by_label(stack, needle)
        .or_else(|_| registry.get_by_machine(stack, needle))
        .map_err(|_| meshvpn_common::Error::PeerNotFound(needle.to_string()).into())
}

pub fn execute(ctx: &MeshContext, cmd: PeerCommands, format: OutputFormat) -> Result<()> {
    let registry = ctx.registry();
    let stack = ctx.stack();

    match cmd {
        PeerCommands::List => {
            let peers: Vec<PeerDisplay> = registry.list(stack)?.into_iter().map(PeerDisplay::from).collect();
            print_list(&peers, format);
        }

        PeerCommands::Get { needle } => {
            let peer = find_peer(ctx, &needle)?;
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&peer)?);
            } else {
                print_item(&PeerDisplay::from(peer), format);
            }
        }

        PeerCommands::Export { output } => {
            let json = registry.export(stack)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
                    print_success(&format!("Exported stack '{}' to {}", stack, path.display()));
                }
                None => println!("{}", json),
            }
        }

        PeerCommands::Import { file } => {
            let json = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let count = registry.import(stack, &json)?;
            print_success(&format!("Imported {} peers into stack '{}'", count, stack));
        }

        PeerCommands::Clear { yes } => {
            if !yes {
                anyhow::bail!("refusing to clear stack '{}' without --yes", stack);
            }
            registry.clear(stack)?;
            print_success(&format!("Cleared stack '{}'", stack));
        }

        PeerCommands::Stacks => {
            let stacks = registry.stacks()?;
            if stacks.is_empty() {
                print_info("No stacks registered");
            }
            for name in stacks {
                println!("{}", name);
            }
        }
    }

    Ok(())
}
