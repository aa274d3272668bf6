//! Callback capabilities for in-flight requests.
//!
//! Every request registered with the transport completes through exactly
//! one of these callbacks, and exactly once: either the matching response
//! arrives, the write fails, or the channel tears down.

use bytes::Bytes;

use crate::error::{Result, TransportError};

/// Handles the reply to a single RPC or upload.
pub trait RpcResponseCallback: Send + Sync {
    /// Called with the response body. The body must be fully consumed
    /// before returning; it is a window into the inbound frame.
    fn on_success(&self, response: Bytes);

    /// Called on remote failure, write failure, or channel teardown.
    fn on_failure(&self, error: TransportError);
}

/// Handles the result of a single chunk fetch.
pub trait ChunkReceivedCallback: Send + Sync {
    fn on_success(&self, chunk_index: i32, buffer: Bytes);

    fn on_failure(&self, chunk_index: i32, error: TransportError);
}

/// Receives the bytes of an opened stream.
///
/// `on_data` may be called repeatedly; `on_complete` fires once after the
/// final bytes. An error returned from `on_data` aborts delivery for this
/// stream.
pub trait StreamCallback: Send + Sync {
    fn on_data(&self, stream_id: &str, data: Bytes) -> Result<()>;

    fn on_complete(&self, stream_id: &str) -> Result<()>;

    fn on_failure(&self, stream_id: &str, error: TransportError);
}

/// A [`StreamCallback`] that knows which stream it belongs to. Returned by
/// [`RpcHandler::receive_stream`](crate::RpcHandler::receive_stream) so
/// the transport can feed it the upload body.
pub trait StreamCallbackWithId: StreamCallback {
    fn id(&self) -> &str;
}
