/// Errors surfaced by gateway client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// An operation needed an open socket and there was none.
    #[error("not connected to gateway")]
    NotConnected,

    /// The `connect` exchange was rejected, malformed, or timed out.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// No matching completion arrived within the caller's bound.
    #[error("request timed out: {method}")]
    Timeout { method: String },

    /// The gateway rejected the request, or a chat run ended in
    /// `error`/`aborted`.
    #[error("gateway error: {0}")]
    Remote(String),

    /// The socket dropped or the client was shut down while waiting.
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame could not be encoded or a payload could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport-level failure from the WebSocket layer.
    #[error(transparent)]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// The configured gateway URL does not parse.
    #[error("invalid gateway url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}
