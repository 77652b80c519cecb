//! Error types for the server core.
//!
//! Configuration and contention errors are returned to the caller. Per-listener
//! resource failures (busy address, unreadable certificate) are logged by the
//! listener set and never surface here unless they make the whole config unusable.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("server '{0}' is disabled, check your config")]
    Disabled(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("start already in progress")]
    AlreadyStarting,

    #[error("server is already running")]
    AlreadyRunning,

    #[error("stop already in progress")]
    AlreadyStopping,

    #[error("parent context is cancelled")]
    Cancelled,

    #[error("failed to load TLS material: {0}")]
    Tls(String),

    #[error("no server instance named '{0}'")]
    UnknownInstance(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rustls::Error> for ServerError {
    fn from(e: rustls::Error) -> Self {
        ServerError::Tls(e.to_string())
    }
}

pub type Result<T, E = ServerError> = std::result::Result<T, E>;
