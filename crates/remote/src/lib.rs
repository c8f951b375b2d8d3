//! meshvpn remote execution
//!
//! SSH connectivity to cluster nodes (direct or via bastion) and the health
//! probes used before any node is touched.

pub mod health;
pub mod session;
pub mod ssh;

pub use health::{probe_ssh_banner, HealthChecker, HealthReport, NodeHealth, SshHealthChecker};
pub use session::{shell_quote, wrap_script, Connector, RemoteSession};
pub use ssh::{CommandOutput, ConnectionManager, SshConnection};
