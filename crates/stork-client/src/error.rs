use thiserror::Error;

use stork_shared::ProtocolError;

/// Errors surfaced by the client runtime.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The orchestrator task is gone (torn down or dropped).
    #[error("Orchestrator has shut down")]
    Shutdown,

    #[error("Group has {count} participants (max {max})")]
    GroupTooLarge { count: usize, max: usize },

    #[error("Direct channel error: {0}")]
    Direct(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Identity store error: {0}")]
    Identity(String),

    #[error("Could not determine application data directory")]
    NoDataDir,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
