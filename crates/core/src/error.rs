//! Error types for RelayPlay Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),
}

pub type Result<T> = std::result::Result<T, Error>;
