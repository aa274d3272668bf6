//! Error types for gridwire.

use thiserror::Error;

/// Main error type for all transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error on the underlying byte pipe.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame length prefix. Fatal to the channel.
    #[error("framing error: {0}")]
    Frame(String),

    /// Unknown type code or truncated message payload. Fatal to the channel.
    #[error("decode error: {0}")]
    Decode(String),

    /// Failure reported by the remote endpoint for a single request.
    #[error("remote failure: {0}")]
    Remote(String),

    /// A deadline elapsed before the response arrived.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The channel went away with requests still outstanding.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Stream fetch rejected before serving any bytes.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// Stream registry violation: unknown stream, out-of-order chunk, or
    /// a request past the end of the sequence.
    #[error("stream error: {0}")]
    Stream(String),

    /// Failure raised by a user-supplied handler.
    #[error("handler error: {0}")]
    Handler(String),

    /// Operation not implemented by this handler.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// Result type alias using [`TransportError`].
pub type Result<T> = std::result::Result<T, TransportError>;
