//! Join and leave commands

use anyhow::Result;
use clap::Args;
use meshvpn_common::{Error, MembershipResult};
use meshvpn_mesh::{JoinRequest, LeaveRequest};
use serde::Serialize;
use std::net::IpAddr;
use tokio_util::sync::CancellationToken;

use crate::context::MeshContext;
use crate::output::{print_error, print_item, print_success, print_warning, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct JoinArgs {
    /// Peer WireGuard public key (base64)
    #[arg(long)]
    pub key: String,

    /// VPN address; reused by label or allocated when omitted
    #[arg(long)]
    pub ip: Option<IpAddr>,

    /// Human-readable label, e.g. the user's laptop name
    #[arg(long, default_value = "")]
    pub label: String,

    /// Machine the peer runs on
    #[arg(long, default_value = "")]
    pub machine: String,

    /// Peer endpoint (host:port) if it is reachable
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Persistent keepalive in seconds, 0 disables
    #[arg(long, default_value = "25")]
    pub keepalive: u32,

    /// Preshared key (base64)
    #[arg(long, env = "MESHVPN_PRESHARED_KEY", hide_env_values = true)]
    pub preshared_key: Option<String>,

    /// Extra networks routed through the peer
    #[arg(long = "allowed-ip")]
    pub allowed_ips: Vec<String>,

    /// Limit to these nodes (default: all)
    #[arg(long = "node")]
    pub nodes: Vec<String>,
}

#[derive(Args)]
pub struct LeaveArgs {
    /// Peer public key
    #[arg(long, required_unless_present = "ip")]
    pub key: Option<String>,

    /// Peer VPN address
    #[arg(long)]
    pub ip: Option<IpAddr>,

    /// Limit to these nodes (default: all)
    #[arg(long = "node")]
    pub nodes: Vec<String>,
}

/// Membership result display wrapper
#[derive(Serialize)]
pub struct MembershipDisplay {
    pub public_key: String,
    pub vpn_ip: String,
    pub configured: usize,
    pub failed: usize,
    pub registry_updated: bool,
}

impl From<&MembershipResult> for MembershipDisplay {
    fn from(result: &MembershipResult) -> Self {
        Self {
            public_key: result.public_key.clone(),
            vpn_ip: result.vpn_ip.map(|ip| ip.to_string()).unwrap_or_default(),
            configured: result.nodes_configured,
            failed: result.nodes_failed,
            registry_updated: result.registry_updated,
        }
    }
}

impl TableDisplay for MembershipDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Public Key", "VPN IP", "Configured", "Failed", "Registry"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.public_key.clone(),
            self.vpn_ip.clone(),
            self.configured.to_string(),
            self.failed.to_string(),
            if self.registry_updated { "updated" } else { "NOT updated" }.to_string(),
        ]
    }
}

fn report(result: &MembershipResult, format: OutputFormat) {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(result).unwrap_or_default());
        return;
    }
    for warning in &result.warnings {
        print_warning(&format!("{}: {}", warning.node, warning.message));
    }
    for error in &result.errors {
        print_error(&format!("{}: {}", error.node, error.message));
    }
    print_item(&MembershipDisplay::from(result), format);
}

/// Print the partial outcome of a fan-out that reached no node, then fail
fn report_failure(err: Error, format: OutputFormat) -> anyhow::Error {
    if let Some(result) = err.membership_result() {
        report(result, format);
    }
    err.into()
}

pub async fn join(ctx: &MeshContext, args: JoinArgs, cancel: &CancellationToken, format: OutputFormat) -> Result<()> {
    let nodes = ctx.settings().select_nodes(&args.nodes)?;
    let manager = ctx.manager().await?;

    let request = JoinRequest {
        public_key: args.key,
        vpn_ip: args.ip,
        label: args.label,
        machine_name: args.machine,
        endpoint: args.endpoint,
        keepalive: args.keepalive,
        preshared_key: args.preshared_key,
        extra_allowed_ips: args.allowed_ips,
        nodes,
    };

    let result = manager
        .join(cancel, request)
        .await
        .map_err(|e| report_failure(e, format))?;

    let complete = result.is_complete();
    let summary = format!(
        "Peer joined at {} on {}/{} nodes",
        result.vpn_ip.map(|ip| ip.to_string()).unwrap_or_default(),
        result.nodes_configured,
        result.attempted()
    );
    report(&result, format);
    if format != OutputFormat::Json {
        if complete {
            print_success(&summary);
        } else {
            print_warning(&summary);
        }
    }
    Ok(())
}

pub async fn leave(ctx: &MeshContext, args: LeaveArgs, cancel: &CancellationToken, format: OutputFormat) -> Result<()> {
    let nodes = ctx.settings().select_nodes(&args.nodes)?;
    let manager = ctx.manager().await?;

    let request = LeaveRequest {
        public_key: args.key,
        vpn_ip: args.ip,
        nodes,
    };

    let result = manager
        .leave(cancel, request)
        .await
        .map_err(|e| report_failure(e, format))?;

    let summary = format!(
        "Peer removed from {}/{} nodes",
        result.nodes_configured,
        result.attempted()
    );
    report(&result, format);
    if format != OutputFormat::Json {
        print_success(&summary);
    }
    Ok(())
}
