use thiserror::Error;

/// Errors raised by adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The adapter has been closed.
    #[error("adapter is closed")]
    Closed,

    /// A packet could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The backend the adapter synchronizes through failed.
    #[error("adapter backend error: {0}")]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// An adapter operation failed.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// The server is already listening.
    #[error("server is already listening")]
    AlreadyListening,

    /// The server has been closed.
    #[error("server is closed")]
    Closed,

    /// A packet could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The connection is no longer open.
    #[error("socket is disconnected")]
    Disconnected,

    /// The server did not open the connection with a `connect` packet.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The URL could not be parsed.
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// I/O error while binding or serving.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The URL scheme is neither http(s) nor ws(s).
    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    /// WebSocket client error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
}
