use std::io;
use thiserror::Error;

/// Central error type for the Sonata engine.
///
/// Only startup and configuration failures surface through this type to the
/// caller of [`crate::Server`]. Per-connection failures are absorbed by the
/// reactor and turn into an error response or a closed socket.
#[derive(Debug, Error)]
pub enum SonataError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A worker thread could not be started.
    #[error("Failed to spawn worker {index}: {source}")]
    WorkerSpawn {
        index: usize,
        #[source]
        source: io::Error,
    },

    /// Installing a signal disposition failed.
    #[error("Signal setup failed: {0}")]
    Signal(String),
}

impl From<serde_json::Error> for SonataError {
    fn from(e: serde_json::Error) -> Self {
        SonataError::Config(e.to_string())
    }
}

pub type SonataResult<T> = Result<T, SonataError>;
