//! Response-side demultiplexing.
//!
//! One handler per channel tracks every request this endpoint has sent
//! and is still waiting on, and routes each inbound response to the
//! registered callback. Registrations are keyed by request id (RPCs and
//! uploads), by stream-chunk id (fetches), or held in an ordered queue
//! (stream opens, which carry no correlation id and rely on send order).
//!
//! The maps are concurrent: the channel's read task removes entries while
//! write-completion hooks on the writer task may remove them on failure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use foldhash::fast::RandomState;

use crate::callback::{ChunkReceivedCallback, RpcResponseCallback, StreamCallback};
use crate::error::TransportError;
use crate::protocol::{Message, StreamChunkId};

/// Tracks outstanding requests and dispatches their responses.
pub struct TransportResponseHandler {
    remote_address: String,
    outstanding_rpcs: DashMap<u64, Arc<dyn RpcResponseCallback>, RandomState>,
    outstanding_fetches: DashMap<StreamChunkId, Arc<dyn ChunkReceivedCallback>, RandomState>,
    stream_callbacks: Mutex<VecDeque<(String, Arc<dyn StreamCallback>)>>,
    /// Nanoseconds since `started` at the last send or receive.
    last_activity: AtomicU64,
    started: Instant,
}

impl TransportResponseHandler {
    pub fn new(remote_address: impl Into<String>) -> Self {
        Self {
            remote_address: remote_address.into(),
            outstanding_rpcs: DashMap::default(),
            outstanding_fetches: DashMap::default(),
            stream_callbacks: Mutex::new(VecDeque::new()),
            last_activity: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Stamp the activity clock. Called on every send and every inbound
    /// frame; the idle watchdog reads it back.
    pub fn record_activity(&self) {
        let nanos = self.started.elapsed().as_nanos() as u64;
        self.last_activity.store(nanos, Ordering::Relaxed);
    }

    /// Time since the last send or receive on this channel.
    pub fn time_since_last_activity(&self) -> Duration {
        let now = self.started.elapsed().as_nanos() as u64;
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_nanos(now.saturating_sub(last))
    }

    /// Number of requests still waiting for a response.
    pub fn outstanding_requests(&self) -> usize {
        self.outstanding_rpcs.len()
            + self.outstanding_fetches.len()
            + self.stream_callbacks.lock().unwrap().len()
    }

    pub fn add_rpc_request(&self, request_id: u64, callback: Arc<dyn RpcResponseCallback>) {
        self.record_activity();
        self.outstanding_rpcs.insert(request_id, callback);
    }

    pub fn remove_rpc_request(&self, request_id: u64) -> Option<Arc<dyn RpcResponseCallback>> {
        self.outstanding_rpcs.remove(&request_id).map(|(_, cb)| cb)
    }

    pub fn add_fetch_request(&self, chunk: StreamChunkId, callback: Arc<dyn ChunkReceivedCallback>) {
        self.record_activity();
        self.outstanding_fetches.insert(chunk, callback);
    }

    pub fn remove_fetch_request(
        &self,
        chunk: StreamChunkId,
    ) -> Option<Arc<dyn ChunkReceivedCallback>> {
        self.outstanding_fetches.remove(&chunk).map(|(_, cb)| cb)
    }

    pub fn add_stream_callback(&self, stream_id: &str, callback: Arc<dyn StreamCallback>) {
        self.record_activity();
        self.stream_callbacks
            .lock()
            .unwrap()
            .push_back((stream_id.to_owned(), callback));
    }

    /// Dispatch one decoded response message to its callback.
    ///
    /// Callbacks are removed before invocation so each fires exactly once.
    /// Responses with no registration are logged and their bodies dropped.
    pub fn handle(&self, message: Message) {
        match message {
            Message::ChunkFetchSuccess { chunk, body } => {
                match self.remove_fetch_request(chunk) {
                    Some(callback) => callback.on_success(chunk.chunk_index, body),
                    None => tracing::warn!(
                        "ignoring chunk {} from {} since it is not outstanding",
                        chunk,
                        self.remote_address
                    ),
                }
            }
            Message::ChunkFetchFailure { chunk, error } => {
                match self.remove_fetch_request(chunk) {
                    Some(callback) => callback.on_failure(
                        chunk.chunk_index,
                        TransportError::Remote(format!(
                            "failure while fetching chunk {chunk}: {error}"
                        )),
                    ),
                    None => tracing::warn!(
                        "ignoring failure for chunk {} from {} since it is not outstanding",
                        chunk,
                        self.remote_address
                    ),
                }
            }
            Message::RpcResponse { request_id, body } => {
                match self.remove_rpc_request(request_id) {
                    Some(callback) => callback.on_success(body),
                    None => tracing::warn!(
                        "ignoring response for RPC {} from {} ({} bytes) since it is not outstanding",
                        request_id,
                        self.remote_address,
                        body.len()
                    ),
                }
            }
            Message::RpcFailure { request_id, error } => {
                match self.remove_rpc_request(request_id) {
                    Some(callback) => callback.on_failure(TransportError::Remote(error)),
                    None => tracing::warn!(
                        "ignoring failure for RPC {} from {} since it is not outstanding",
                        request_id,
                        self.remote_address
                    ),
                }
            }
            Message::StreamResponse {
                stream_id,
                byte_count,
                body,
            } => {
                let entry = self.stream_callbacks.lock().unwrap().pop_front();
                match entry {
                    Some((_, callback)) => {
                        debug_assert_eq!(byte_count as usize, body.len());
                        if let Err(e) = callback.on_data(&stream_id, body) {
                            tracing::error!(
                                "error delivering stream {stream_id} data to callback: {e}"
                            );
                            callback
                                .on_failure(&stream_id, TransportError::Stream(e.to_string()));
                        } else if let Err(e) = callback.on_complete(&stream_id) {
                            tracing::error!(
                                "error completing stream {stream_id} callback: {e}"
                            );
                        }
                    }
                    None => tracing::error!(
                        "could not find callback for StreamResponse {stream_id} from {}",
                        self.remote_address
                    ),
                }
            }
            Message::StreamFailure { stream_id, error } => {
                let entry = self.stream_callbacks.lock().unwrap().pop_front();
                match entry {
                    Some((_, callback)) => {
                        callback.on_failure(&stream_id, TransportError::Remote(error));
                    }
                    None => tracing::warn!(
                        "stream failure for {stream_id} from {} with no registered callback",
                        self.remote_address
                    ),
                }
            }
            other => tracing::error!(
                "request message (type code {}) routed to response handler",
                other.type_code()
            ),
        }
    }

    /// Fail every outstanding callback, each exactly once.
    ///
    /// Used on channel teardown; the factory builds a fresh error per
    /// callback (carrying the remote address and reason).
    pub fn fail_outstanding(&self, error: impl Fn() -> TransportError) {
        let outstanding = self.outstanding_requests();
        if outstanding > 0 {
            tracing::warn!(
                "{} requests still outstanding when connection to {} goes away",
                outstanding,
                self.remote_address
            );
        }

        let rpc_ids: Vec<u64> = self.outstanding_rpcs.iter().map(|e| *e.key()).collect();
        for request_id in rpc_ids {
            if let Some(callback) = self.remove_rpc_request(request_id) {
                callback.on_failure(error());
            }
        }

        let chunks: Vec<StreamChunkId> =
            self.outstanding_fetches.iter().map(|e| *e.key()).collect();
        for chunk in chunks {
            if let Some(callback) = self.remove_fetch_request(chunk) {
                callback.on_failure(chunk.chunk_index, error());
            }
        }

        let drained: Vec<(String, Arc<dyn StreamCallback>)> = {
            let mut queue = self.stream_callbacks.lock().unwrap();
            queue.drain(..).collect()
        };
        for (stream_id, callback) in drained {
            callback.on_failure(&stream_id, error());
        }
    }
}
