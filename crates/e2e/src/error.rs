//! Error types for end-to-end scenarios

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Settings parse error: {0}")]
    Settings(#[from] toml::de::Error),

    #[error("Mesh error: {0}")]
    Mesh(#[from] meshvpn_common::Error),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type E2eResult<T> = Result<T, E2eError>;
