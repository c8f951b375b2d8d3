//! meshvpn Common Library
//!
//! Shared types, errors, retry policy and the durable peer registry used by
//! every meshvpn crate.

pub mod crypto;
pub mod error;
pub mod registry;
pub mod retry;
pub mod types;

// Re-export commonly used types
pub use crypto::{generate_keypair, WgKeyPair};
pub use error::{Error, Result};
pub use registry::PeerRegistry;
pub use retry::{RetryError, RetryPolicy};
pub use types::*;

/// meshvpn version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default data directory
pub fn default_data_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".meshvpn")
}

/// Default peer registry directory
pub fn default_registry_path() -> std::path::PathBuf {
    default_data_path().join("peers")
}

/// Default settings file
pub fn default_config_path() -> std::path::PathBuf {
    default_data_path().join("config.toml")
}

/// Default SSH private key
pub fn default_ssh_key_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".ssh")
        .join("id_ed25519")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
