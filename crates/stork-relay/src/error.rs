use stork_shared::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Binary frame is not valid UTF-8")]
    NotUtf8,
}
