use relay_realtime::AdapterError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The adapter was initialized twice.
    #[error("adapter is already initialized")]
    AlreadyInitialized,

    /// The adapter has been closed.
    #[error("adapter is closed")]
    Closed,

    /// An envelope could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The broker rejected an operation.
    #[error("broker error: {0}")]
    Broker(Box<dyn std::error::Error + Send + Sync>),
}

impl From<Error> for AdapterError {
    fn from(error: Error) -> Self {
        match error {
            Error::Closed => Self::Closed,
            Error::Codec(e) => Self::Codec(e),
            other => Self::Backend(Box::new(other)),
        }
    }
}
