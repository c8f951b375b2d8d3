//! Error types for meshvpn

use crate::retry::RetryError;
use crate::types::{Hop, MembershipResult};
use thiserror::Error;

/// Result type alias using meshvpn Error
pub type Result<T> = std::result::Result<T, Error>;

/// meshvpn error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid peer configuration: {0}")]
    InvalidPeerConfig(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Connection to {hop} {host} failed: {message}")]
    Connection {
        hop: Hop,
        host: String,
        message: String,
    },

    #[error("Bastion {host} unreachable: {message}")]
    Bastion { host: String, message: String },

    #[error("Command `{command}` failed (exit code {}): {stderr}", display_exit_code(.exit_code))]
    CommandFailed {
        command: String,
        exit_code: Option<u32>,
        stdout: String,
        stderr: String,
    },

    #[error("Connection to {0} is closed")]
    ConnectionClosed(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Retry(Box<RetryError<Error>>),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("Subnet {subnet} has no free addresses")]
    SubnetExhausted { subnet: String },

    #[error("{operation} failed on all {attempted} nodes")]
    AllNodesFailed {
        operation: &'static str,
        attempted: usize,
        result: Box<MembershipResult>,
    },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Coordinator error: {0}")]
    Coordinator(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn display_exit_code(code: &Option<u32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

impl From<RetryError<Error>> for Error {
    fn from(e: RetryError<Error>) -> Self {
        Error::Retry(Box::new(e))
    }
}

impl Error {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Partial outcome carried by a fan-out failure, if any
    pub fn membership_result(&self) -> Option<&MembershipResult> {
        match self {
            Error::AllNodesFailed { result, .. } => Some(result),
            _ => None,
        }
    }
}
