//! Key generation and client configuration

use anyhow::{Context, Result};
use clap::Subcommand;
use meshvpn_common::crypto::public_key_from_private;
use meshvpn_common::generate_keypair;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::context::MeshContext;
use crate::output::{print_success, print_value, OutputFormat};

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Generate a WireGuard key pair
    Generate,

    /// Derive the public key of a private key
    Public {
        private_key: String,
    },

    /// Render a client configuration for a registered peer
    ClientConfig {
        /// Peer public key
        key: String,

        /// Private key to embed; a placeholder is written otherwise
        #[arg(long, env = "MESHVPN_PRIVATE_KEY", hide_env_values = true)]
        private_key: Option<String>,

        /// DNS server for the client
        #[arg(long)]
        dns: Option<String>,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long = "node")]
        nodes: Vec<String>,
    },
}

/// Write `content` owner-only
fn write_secret(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

pub async fn execute(
    ctx: &MeshContext,
    cmd: KeyCommands,
    cancel: &CancellationToken,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        KeyCommands::Generate => {
            let pair = generate_keypair();
            let message = format!("PrivateKey = {}\nPublicKey  = {}", pair.private_key, pair.public_key);
            print_value(&pair, &message, format);
        }

        KeyCommands::Public { private_key } => {
            let public = public_key_from_private(private_key.trim())?;
            print_value(&serde_json::json!({ "public_key": public }), &public, format);
        }

        KeyCommands::ClientConfig {
            key,
            private_key,
            dns,
            output,
            nodes,
        } => {
            let nodes = ctx.settings().select_nodes(&nodes)?;
            let config = ctx
                .manager()
                .await?
                .client_config(cancel, &key, private_key, dns, &nodes)
                .await?;
            match output {
                Some(path) => {
                    write_secret(&path, &config)?;
                    print_success(&format!("Client config written to {}", path.display()));
                }
                None => print!("{}", config),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_secret_is_owner_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("client.conf");
        write_secret(&path, "[Interface]\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[Interface]\n");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
