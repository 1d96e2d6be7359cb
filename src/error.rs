//! src/error.rs
//!
//! Defines the library's custom, comprehensive `Error` enum using `thiserror`.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed envelope: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Cryptography error: {0}")]
    Crypto(String),

    #[error("Verification failure: {0}")]
    Verification(&'static str),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("No node row for {0}")]
    UnknownNode(String),

    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("Invalid zone geometry: {0}")]
    Geometry(String),

    #[error("Tokio task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        Error::Crypto(e.to_string())
    }
}
