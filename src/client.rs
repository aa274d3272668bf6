//! Outbound request API.
//!
//! A [`TransportClient`] is the sending half of one channel. It enables
//! four request flavors:
//!
//! - [`send_rpc`](TransportClient::send_rpc): opaque single-shot RPC,
//!   answered by exactly one response
//! - [`send`](TransportClient::send): fire-and-forget, no response and no
//!   delivery guarantee
//! - [`fetch_chunk`](TransportClient::fetch_chunk) /
//!   [`stream`](TransportClient::stream): pull chunked or whole stream
//!   data from the remote registry
//! - [`upload_stream`](TransportClient::upload_stream): push meta plus a
//!   data payload to the remote handler
//!
//! Every registering operation follows the same discipline: the callback
//! is registered with the response handler *before* the frame is written,
//! and the write-completion hook unregisters and fails it if the write
//! never reaches the wire (closing the channel as well).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::buffer::ManagedBuffer;
use crate::callback::{ChunkReceivedCallback, RpcResponseCallback, StreamCallback};
use crate::channel::{Channel, ChannelId};
use crate::error::{Result, TransportError};
use crate::protocol::{Message, StreamChunkId};
use crate::response::TransportResponseHandler;

/// Client for sending requests on one channel.
///
/// Cheap to share via `Arc`; all operations take `&self`. The server side
/// of the same channel holds an identical client (the "reverse client")
/// for talking back to the requester.
pub struct TransportClient {
    channel: Channel,
    handler: Arc<TransportResponseHandler>,
    client_id: OnceLock<String>,
    timed_out: AtomicBool,
    next_request_id: AtomicU64,
    /// Serializes `stream()` so callback-queue order matches write order.
    stream_lock: Mutex<()>,
}

impl TransportClient {
    pub(crate) fn new(channel: Channel, handler: Arc<TransportResponseHandler>) -> Self {
        Self {
            channel,
            handler,
            client_id: OnceLock::new(),
            timed_out: AtomicBool::new(false),
            next_request_id: AtomicU64::new(request_id_seed()),
            stream_lock: Mutex::new(()),
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn remote_address(&self) -> &str {
        self.channel.remote_address()
    }

    /// Opaque id the embedder's authentication layer attached to this
    /// client, if any.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.get().map(|s| s.as_str())
    }

    /// Attach the client id. May be set only once.
    pub fn set_client_id(&self, client_id: impl Into<String>) {
        if self.client_id.set(client_id.into()).is_err() {
            tracing::warn!(
                "client id for {} has already been set",
                self.remote_address()
            );
        }
    }

    pub fn is_active(&self) -> bool {
        !self.timed_out.load(Ordering::Relaxed) && self.channel.is_open()
    }

    /// Mark this channel as having timed out. Set by the idle watchdog.
    pub fn time_out(&self) {
        self.timed_out.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Relaxed)
    }

    /// Close the underlying channel. The inbound loop observes the close
    /// and fails every outstanding callback with the remote address.
    pub fn close(&self) {
        self.channel.close();
    }

    /// Number of requests sent on this channel still awaiting a response.
    pub fn outstanding_requests(&self) -> usize {
        self.handler.outstanding_requests()
    }

    fn next_request_id(&self) -> u64 {
        // 63-bit ids: the wire carries them as i64.
        self.next_request_id.fetch_add(1, Ordering::Relaxed) & i64::MAX as u64
    }

    /// Send an opaque message to the remote `RpcHandler`. The callback is
    /// invoked with the reply or with any failure. Returns the request id.
    pub fn send_rpc(&self, message: Bytes, callback: Arc<dyn RpcResponseCallback>) -> u64 {
        tracing::trace!("sending RPC to {}", self.remote_address());

        let request_id = self.next_request_id();
        self.handler.add_rpc_request(request_id, callback);

        let handler = self.handler.clone();
        let channel = self.channel.clone();
        let remote = self.remote_address().to_owned();
        let started = Instant::now();
        self.channel.write(
            Message::RpcRequest {
                request_id,
                body: message,
            },
            Some(Box::new(move |result| match result {
                Ok(()) => tracing::trace!(
                    "sending RPC {request_id} to {remote} took {:?}",
                    started.elapsed()
                ),
                Err(e) => {
                    let error = format!("failed to send RPC {request_id} to {remote}: {e}");
                    tracing::error!("{error}");
                    channel.close();
                    if let Some(callback) = handler.remove_rpc_request(request_id) {
                        callback.on_failure(TransportError::Io(std::io::Error::new(
                            e.kind(),
                            error,
                        )));
                    }
                }
            })),
        );

        request_id
    }

    /// Send an RPC and wait for its reply, up to `timeout`.
    ///
    /// The reply payload is copied into a fresh buffer before delivery;
    /// the inbound frame is released as soon as the callback returns. On
    /// timeout the registration stays in place, and a late reply is
    /// logged and discarded.
    pub async fn send_rpc_sync(&self, message: Bytes, timeout: Duration) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        let callback = Arc::new(BlockingRpcCallback {
            remote: self.remote_address().to_owned(),
            reply: Mutex::new(Some(tx)),
        });
        let request_id = self.send_rpc(message, callback);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ChannelClosed(format!(
                "connection to {} dropped RPC {request_id} without completing it",
                self.remote_address()
            ))),
            Err(_) => Err(TransportError::Timeout(format!(
                "no reply to RPC {request_id} from {} within {timeout:?}",
                self.remote_address()
            ))),
        }
    }

    /// Send an opaque message expecting no reply and with no delivery
    /// guarantee.
    pub fn send(&self, message: Bytes) {
        self.handler.record_activity();
        self.channel
            .write(Message::OneWayMessage { body: message }, None);
    }

    /// Send `meta` and `data` to the remote `RpcHandler` as an upload.
    /// Meta is buffered whole on the receiving side before the data is
    /// streamed to the handler's stream callback.
    pub fn upload_stream(
        &self,
        meta: &dyn ManagedBuffer,
        data: &dyn ManagedBuffer,
        callback: Arc<dyn RpcResponseCallback>,
    ) -> Result<u64> {
        tracing::trace!("sending upload to {}", self.remote_address());
        let meta = meta.to_bytes()?;
        let data = data.to_bytes()?;

        let request_id = self.next_request_id();
        self.handler.add_rpc_request(request_id, callback);

        let handler = self.handler.clone();
        let channel = self.channel.clone();
        let remote = self.remote_address().to_owned();
        let started = Instant::now();
        self.channel.write(
            Message::UploadStream {
                request_id,
                meta,
                data,
            },
            Some(Box::new(move |result| match result {
                Ok(()) => tracing::trace!(
                    "sending upload {request_id} to {remote} took {:?}",
                    started.elapsed()
                ),
                Err(e) => {
                    let error = format!("failed to send upload {request_id} to {remote}: {e}");
                    tracing::error!("{error}");
                    channel.close();
                    if let Some(callback) = handler.remove_rpc_request(request_id) {
                        callback.on_failure(TransportError::Io(std::io::Error::new(
                            e.kind(),
                            error,
                        )));
                    }
                }
            })),
        );

        Ok(request_id)
    }

    /// Request one chunk from a pre-negotiated remote stream.
    ///
    /// Chunk indices start at 0. Multiple fetches may be outstanding at
    /// once; replies arrive in request order for a single client.
    pub fn fetch_chunk(
        &self,
        stream_id: u64,
        chunk_index: i32,
        callback: Arc<dyn ChunkReceivedCallback>,
    ) {
        tracing::debug!(
            "sending fetch chunk request {chunk_index} to {}",
            self.remote_address()
        );

        let chunk = StreamChunkId::new(stream_id, chunk_index);
        self.handler.add_fetch_request(chunk, callback.clone());

        let handler = self.handler.clone();
        let channel = self.channel.clone();
        let remote = self.remote_address().to_owned();
        let started = Instant::now();
        self.channel.write(
            Message::ChunkFetchRequest { chunk },
            Some(Box::new(move |result| match result {
                Ok(()) => tracing::trace!(
                    "sending chunk request {chunk} to {remote} took {:?}",
                    started.elapsed()
                ),
                Err(e) => {
                    let error = format!("failed to send chunk request {chunk} to {remote}: {e}");
                    tracing::error!("{error}");
                    channel.close();
                    handler.remove_fetch_request(chunk);
                    callback.on_failure(
                        chunk_index,
                        TransportError::Io(std::io::Error::new(e.kind(), error)),
                    );
                }
            })),
        );
    }

    /// Open stream `stream_id` from the remote side, delivering its bytes
    /// to `callback`.
    ///
    /// The callback queue and the socket carry no correlation id for
    /// streams, so enqueue and write must happen atomically; concurrent
    /// `stream` calls on one client are serialized under its own lock to
    /// keep responses matched to callbacks.
    pub fn stream(&self, stream_id: &str, callback: Arc<dyn StreamCallback>) {
        tracing::debug!(
            "sending stream request for {stream_id} to {}",
            self.remote_address()
        );

        let guard = self.stream_lock.lock().unwrap();
        self.handler.add_stream_callback(stream_id, callback.clone());

        let channel = self.channel.clone();
        let remote = self.remote_address().to_owned();
        let stream_id_owned = stream_id.to_owned();
        let started = Instant::now();
        self.channel.write(
            Message::StreamRequest {
                stream_id: stream_id.to_owned(),
            },
            Some(Box::new(move |result| match result {
                Ok(()) => tracing::trace!(
                    "sending stream request {stream_id_owned} to {remote} took {:?}",
                    started.elapsed()
                ),
                Err(e) => {
                    let error =
                        format!("failed to send stream request {stream_id_owned} to {remote}: {e}");
                    tracing::error!("{error}");
                    channel.close();
                    callback.on_failure(
                        &stream_id_owned,
                        TransportError::Io(std::io::Error::new(e.kind(), error)),
                    );
                }
            })),
        );
        drop(guard);
    }

    #[cfg(test)]
    pub(crate) fn new_detached_for_test(remote_address: &str) -> Self {
        let (channel, _rx) = Channel::new_detached(remote_address);
        let handler = Arc::new(TransportResponseHandler::new(remote_address));
        Self::new(channel, handler)
    }
}

/// Adapter completing a oneshot future from the async RPC callback.
struct BlockingRpcCallback {
    remote: String,
    reply: Mutex<Option<oneshot::Sender<Result<Bytes>>>>,
}

impl RpcResponseCallback for BlockingRpcCallback {
    fn on_success(&self, response: Bytes) {
        // The inbound frame is released when this returns; hand the
        // waiter its own copy.
        let copy = Bytes::copy_from_slice(&response);
        match self.reply.lock().unwrap().take() {
            Some(tx) => {
                if tx.send(Ok(copy)).is_err() {
                    tracing::debug!("late RPC response from {} discarded", self.remote);
                }
            }
            None => tracing::warn!("RPC callback for {} completed twice", self.remote),
        }
    }

    fn on_failure(&self, error: TransportError) {
        if let Some(tx) = self.reply.lock().unwrap().take() {
            let _ = tx.send(Err(error));
        }
    }
}

/// Random starting point for the per-client request id counter, so ids
/// from different clients are distinguishable in logs. Uniqueness only
/// matters per channel.
fn request_id_seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id() as u64;
    (nanos.wrapping_mul(0x517c_c1b7_2722_0a95) ^ pid) & i64::MAX as u64
}
