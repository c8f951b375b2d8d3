//! meshctl - meshvpn peer admission CLI
//!
//! Admits and removes VPN peers across the cluster nodes, and inspects the
//! nodes and the peer registry.

use clap::{Parser, Subcommand};
use meshvpn_cli::commands::{keys, membership, nodes, peers};
use meshvpn_cli::context::MeshContext;
use meshvpn_cli::output::{self, print_info, print_success};
use meshvpn_mesh::MeshSettings;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// meshctl - WireGuard/Headscale mesh admission
#[derive(Parser)]
#[command(name = "meshctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Settings file
    #[arg(long, env = "MESHVPN_CONFIG", default_value_os_t = meshvpn_common::default_config_path(), global = true)]
    config: PathBuf,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Admit a peer on every node
    Join(membership::JoinArgs),

    /// Remove a peer from every node
    Leave(membership::LeaveArgs),

    /// Inspect the peer registry
    #[command(subcommand)]
    Peers(peers::PeerCommands),

    /// Inspect and operate cluster nodes
    #[command(subcommand)]
    Nodes(nodes::NodeCommands),

    /// Keys and client configuration
    #[command(subcommand)]
    Keys(keys::KeyCommands),

    /// Write a default settings file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show version information
    Version,
}

/// Filter used when `RUST_LOG` is unset
fn default_log_filter(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = default_log_filter(cli.verbose);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight operations");
            token.cancel();
        }
    });

    match cli.command {
        Commands::Init { force } => {
            if cli.config.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", cli.config.display());
            }
            MeshSettings::default().save(&cli.config)?;
            print_success(&format!("Wrote {}", cli.config.display()));
        }
        Commands::Version => {
            println!("meshctl v{}", meshvpn_common::VERSION);
            print_info(&format!("Settings: {}", cli.config.display()));
        }
        command => {
            let ctx = MeshContext::load(&cli.config)?;
            match command {
                Commands::Join(args) => membership::join(&ctx, args, &cancel, cli.format).await?,
                Commands::Leave(args) => membership::leave(&ctx, args, &cancel, cli.format).await?,
                Commands::Peers(cmd) => peers::execute(&ctx, cmd, cli.format)?,
                Commands::Nodes(cmd) => nodes::execute(&ctx, cmd, &cancel, cli.format).await?,
                Commands::Keys(cmd) => keys::execute(&ctx, cmd, &cancel, cli.format).await?,
                Commands::Init { .. } | Commands::Version => {}
            }
        }
    }

    Ok(())
}
