//! Request-side dispatch.
//!
//! Decoded request messages are handed to the user-supplied [`RpcHandler`]
//! or served from the [`StreamManager`] registry, and the reply (success
//! or failure variant, same id) is written back on the same channel.

use std::sync::Arc;

use bytes::Bytes;

use crate::callback::{RpcResponseCallback, StreamCallbackWithId};
use crate::channel::Channel;
use crate::client::TransportClient;
use crate::error::{Result, TransportError};
use crate::protocol::{Message, StreamChunkId};
use crate::stream::StreamManager;

/// Handler for messages sent by a remote [`TransportClient`].
///
/// Implemented by the embedder; one instance serves every channel of a
/// [`TransportContext`](crate::TransportContext). For a single channel,
/// `receive` and `receive_stream` are never called concurrently. The
/// calls run on the channel's inbound task, so implementations must not
/// block; long-running work belongs on a separate pool, completing the
/// callback asynchronously.
pub trait RpcHandler: Send + Sync {
    /// Receive a single RPC. An `Err` return is reported back to the
    /// requester as a standard RPC failure carrying the error text.
    ///
    /// `client` enables the handler to make requests back to the sender
    /// of this RPC; it is the same instance for the whole channel. The
    /// callback must be completed exactly once, now or later.
    fn receive(
        &self,
        client: &Arc<TransportClient>,
        message: Bytes,
        callback: Arc<dyn RpcResponseCallback>,
    ) -> Result<()>;

    /// Receive an RPC that expects no reply. The default forwards to
    /// [`receive`](Self::receive) with a sink that logs if the handler
    /// completes it anyway.
    fn receive_one_way(&self, client: &Arc<TransportClient>, message: Bytes) -> Result<()> {
        self.receive(client, message, Arc::new(OneWayRpcCallback))
    }

    /// Receive an RPC whose data arrives as a stream. `header` is small
    /// and fully buffered; the returned stream callback is then fed the
    /// data bytes. An error while receiving data fails the whole channel;
    /// an error in the callback's completion step is reported as a
    /// standard RPC failure and the channel stays up.
    fn receive_stream(
        &self,
        _client: &Arc<TransportClient>,
        _header: Bytes,
        _callback: Arc<dyn RpcResponseCallback>,
    ) -> Result<Box<dyn StreamCallbackWithId>> {
        Err(TransportError::Unsupported("receive_stream"))
    }

    /// The registry of streams this handler serves chunks from.
    fn stream_manager(&self) -> Arc<dyn StreamManager>;

    /// The channel associated with the given client became active.
    fn channel_active(&self, _client: &Arc<TransportClient>) {}

    /// The channel associated with the given client went away. No further
    /// requests will arrive from it.
    fn channel_inactive(&self, _client: &Arc<TransportClient>) {}

    fn exception_caught(&self, _error: &TransportError, _client: &Arc<TransportClient>) {}
}

/// Sink for one-way messages; completing it only produces a log line.
struct OneWayRpcCallback;

impl RpcResponseCallback for OneWayRpcCallback {
    fn on_success(&self, _response: Bytes) {
        tracing::warn!("response provided for one-way RPC");
    }

    fn on_failure(&self, error: TransportError) {
        tracing::error!("error response provided for one-way RPC: {error}");
    }
}

/// Processes requests arriving on one channel and writes the replies.
pub struct TransportRequestHandler {
    channel: Channel,
    /// Client on the same channel, for talking back to the requester.
    reverse_client: Arc<TransportClient>,
    rpc_handler: Arc<dyn RpcHandler>,
    /// Chunk in-flight cap; exceeding it closes the channel.
    max_chunks_being_transferred: u64,
}

impl TransportRequestHandler {
    pub(crate) fn new(
        channel: Channel,
        reverse_client: Arc<TransportClient>,
        rpc_handler: Arc<dyn RpcHandler>,
        max_chunks_being_transferred: u64,
    ) -> Self {
        Self {
            channel,
            reverse_client,
            rpc_handler,
            max_chunks_being_transferred,
        }
    }

    /// Dispatch one decoded request message.
    ///
    /// Returns `Err` only for failures that must take the channel down.
    pub fn handle(&self, message: Message) -> Result<()> {
        match message {
            Message::RpcRequest { request_id, body } => {
                self.process_rpc_request(request_id, body);
                Ok(())
            }
            Message::OneWayMessage { body } => {
                self.process_one_way_message(body);
                Ok(())
            }
            Message::UploadStream {
                request_id,
                meta,
                data,
            } => self.process_upload_stream(request_id, meta, data),
            Message::ChunkFetchRequest { chunk } => {
                self.process_fetch_request(chunk);
                Ok(())
            }
            Message::StreamRequest { stream_id } => {
                self.process_stream_request(stream_id);
                Ok(())
            }
            other => {
                tracing::error!(
                    "response message (type code {}) routed to request handler",
                    other.type_code()
                );
                Ok(())
            }
        }
    }

    fn process_rpc_request(&self, request_id: u64, body: Bytes) {
        let callback: Arc<dyn RpcResponseCallback> = Arc::new(RpcResponder {
            channel: self.channel.clone(),
            request_id,
        });
        if let Err(e) = self.rpc_handler.receive(&self.reverse_client, body, callback) {
            tracing::error!("error while invoking RpcHandler::receive on RPC {request_id}: {e}");
            respond(
                &self.channel,
                Message::RpcFailure {
                    request_id,
                    error: e.to_string(),
                },
            );
        }
    }

    fn process_one_way_message(&self, body: Bytes) {
        if let Err(e) = self.rpc_handler.receive_one_way(&self.reverse_client, body) {
            tracing::error!("error while invoking RpcHandler::receive for one-way message: {e}");
        }
    }

    fn process_upload_stream(&self, request_id: u64, meta: Bytes, data: Bytes) -> Result<()> {
        let callback: Arc<dyn RpcResponseCallback> = Arc::new(RpcResponder {
            channel: self.channel.clone(),
            request_id,
        });
        let stream_callback = match self.rpc_handler.receive_stream(
            &self.reverse_client,
            meta,
            callback.clone(),
        ) {
            Ok(stream_callback) => stream_callback,
            Err(e) => {
                tracing::error!(
                    "error while invoking RpcHandler::receive_stream on RPC {request_id}: {e}"
                );
                respond(
                    &self.channel,
                    Message::RpcFailure {
                        request_id,
                        error: e.to_string(),
                    },
                );
                return Ok(());
            }
        };

        let stream_id = stream_callback.id().to_owned();
        if let Err(e) = stream_callback.on_data(&stream_id, data) {
            // Data could not be received; the channel is no longer usable.
            let error = format!("failure while receiving upload stream {stream_id}: {e}");
            tracing::error!("{error}");
            stream_callback.on_failure(&stream_id, TransportError::Handler(e.to_string()));
            return Err(TransportError::Handler(error));
        }
        if let Err(e) = stream_callback.on_complete(&stream_id) {
            tracing::warn!("failure while completing upload stream {stream_id}: {e}");
            callback.on_failure(TransportError::Handler(e.to_string()));
        }
        Ok(())
    }

    fn process_fetch_request(&self, chunk: StreamChunkId) {
        tracing::debug!(
            "received request from {} to fetch chunk {chunk}",
            self.channel.remote_address()
        );

        let stream_manager = self.rpc_handler.stream_manager();
        let in_flight = stream_manager.chunks_being_transferred();
        if in_flight >= self.max_chunks_being_transferred {
            tracing::error!(
                "{in_flight} chunks being transferred on {}, above the limit of {}; closing connection",
                self.channel.remote_address(),
                self.max_chunks_being_transferred
            );
            self.channel.close();
            return;
        }

        let buffer = stream_manager
            .check_authorization(&self.reverse_client, chunk.stream_id)
            .and_then(|()| stream_manager.get_chunk(chunk.stream_id, chunk.chunk_index))
            .and_then(|buffer| buffer.to_bytes());
        let body = match buffer {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(
                    "error opening chunk {chunk} for request from {}: {e}",
                    self.channel.remote_address()
                );
                respond(
                    &self.channel,
                    Message::ChunkFetchFailure {
                        chunk,
                        error: e.to_string(),
                    },
                );
                return;
            }
        };

        stream_manager.chunk_being_sent(chunk.stream_id);
        let stream_id = chunk.stream_id;
        respond_then(
            &self.channel,
            Message::ChunkFetchSuccess { chunk, body },
            move || stream_manager.chunk_sent(stream_id),
        );
    }

    fn process_stream_request(&self, stream_id: String) {
        tracing::debug!(
            "received request from {} to open stream {stream_id}",
            self.channel.remote_address()
        );

        let stream_manager = self.rpc_handler.stream_manager();
        let body = match stream_manager
            .open_stream(&stream_id)
            .and_then(|buffer| buffer.to_bytes())
        {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(
                    "error opening stream {stream_id} for request from {}: {e}",
                    self.channel.remote_address()
                );
                respond(
                    &self.channel,
                    Message::StreamFailure {
                        stream_id,
                        error: e.to_string(),
                    },
                );
                return;
            }
        };

        stream_manager.stream_being_sent(&stream_id);
        let byte_count = body.len() as u64;
        let sent_id = stream_id.clone();
        respond_then(
            &self.channel,
            Message::StreamResponse {
                stream_id,
                byte_count,
                body,
            },
            move || stream_manager.stream_sent(&sent_id),
        );
    }
}

/// Callback mapping handler completion onto the reply wire messages.
struct RpcResponder {
    channel: Channel,
    request_id: u64,
}

impl RpcResponseCallback for RpcResponder {
    fn on_success(&self, response: Bytes) {
        respond(
            &self.channel,
            Message::RpcResponse {
                request_id: self.request_id,
                body: response,
            },
        );
    }

    fn on_failure(&self, error: TransportError) {
        respond(
            &self.channel,
            Message::RpcFailure {
                request_id: self.request_id,
                error: error.to_string(),
            },
        );
    }
}

/// Write a reply with the standard listener: log on success, log and
/// close the channel on failure.
fn respond(channel: &Channel, message: Message) {
    respond_then(channel, message, || {});
}

/// Like [`respond`], running `after` once the write completes either way.
fn respond_then<F>(channel: &Channel, message: Message, after: F)
where
    F: FnOnce() + Send + Sync + 'static,
{
    let remote = channel.remote_address().to_owned();
    let desc = describe(&message);
    let channel_handle = channel.clone();
    channel.write(
        message,
        Some(Box::new(move |result| {
            after();
            match result {
                Ok(()) => tracing::trace!("sent {desc} to {remote}"),
                Err(e) => {
                    tracing::error!("error sending {desc} to {remote}, closing connection: {e}");
                    channel_handle.close();
                }
            }
        })),
    );
}

fn describe(message: &Message) -> String {
    match message {
        Message::ChunkFetchSuccess { chunk, .. } => format!("ChunkFetchSuccess({chunk})"),
        Message::ChunkFetchFailure { chunk, .. } => format!("ChunkFetchFailure({chunk})"),
        Message::RpcResponse { request_id, .. } => format!("RpcResponse({request_id})"),
        Message::RpcFailure { request_id, .. } => format!("RpcFailure({request_id})"),
        Message::StreamResponse { stream_id, .. } => format!("StreamResponse({stream_id})"),
        Message::StreamFailure { stream_id, .. } => format!("StreamFailure({stream_id})"),
        other => format!("message type {}", other.type_code()),
    }
}
