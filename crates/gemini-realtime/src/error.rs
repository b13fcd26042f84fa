use thiserror::Error;

/// Errors surfaced by a [`GeminiLiveConnection`](crate::GeminiLiveConnection).
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// `connect` or a send was attempted before `configure`.
    #[error("Connection has not been configured")]
    NotConfigured,

    /// A connect is already in flight, or a socket is already open.
    #[error("Connection is already connecting or open")]
    AlreadyConnecting,

    /// The operation needs a completed handshake.
    #[error("Not connected")]
    NotConnected,

    /// `disconnect` was called while the handshake was still being sent.
    #[error("Connect was cancelled")]
    Cancelled,

    /// The socket could not be opened.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A frame could not be written to the socket.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The configuration cannot produce a usable endpoint.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Result type for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RealtimeError::WebSocket(err.to_string())
    }
}
