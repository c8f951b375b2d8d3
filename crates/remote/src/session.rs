//! Remote execution seams
//!
//! `Connector` opens channels to nodes and `RemoteSession` runs commands on
//! them. The SSH implementation lives in [`crate::ssh`]; anything else that
//! speaks these traits (e.g. an in-memory fleet) can stand in for it.

use async_trait::async_trait;
use meshvpn_common::{ConnectionConfig, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Heredoc terminator used by [`wrap_script`]
pub const SCRIPT_MARKER: &str = "MESHVPN_SCRIPT_EOF";

/// Command channel to a single node
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Host this session is attached to
    fn host(&self) -> &str;

    /// Run a command; non-zero exit is an error carrying stderr
    async fn execute(&self, command: &str) -> Result<String>;

    /// Deliver a multi-line script in one `bash -s` invocation
    async fn execute_script(&self, script: &str) -> Result<String> {
        self.execute(&wrap_script(script)).await
    }

    /// Liveness probe
    async fn is_alive(&self) -> bool;

    /// Close the session. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}

/// Opens sessions to nodes
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        config: ConnectionConfig,
    ) -> Result<Arc<dyn RemoteSession>>;
}

/// Wrap a script into a single `bash -s` heredoc command
pub fn wrap_script(script: &str) -> String {
    let body = script.trim_end_matches('\n');
    format!(
        "bash -s <<'{marker}'\nset -e\n{body}\n{marker}",
        marker = SCRIPT_MARKER,
        body = body
    )
}

/// Quote a value for POSIX sh
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:,=+@%".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
