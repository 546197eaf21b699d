use relay_broker::BrokerError;
use thiserror::Error;

/// An error that can occur when using a memory broker client.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// `connect` was called on a handle that is already connected.
    #[error("broker client is already connected")]
    AlreadyConnected,

    /// The handle is not connected, or has quit.
    #[error("broker client is not connected")]
    NotConnected,
}

impl BrokerError for Error {}
