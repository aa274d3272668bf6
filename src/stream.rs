//! Server-side stream registry.
//!
//! A stream is a lazily produced, one-pass sequence of managed buffers
//! registered under a fresh id and bound to a single channel. Clients
//! consume it chunk by chunk, strictly in order; the stream disappears
//! when the last buffer is handed out, or when the owning channel
//! terminates (at which point every remaining buffer is released).

use std::iter::Peekable;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use foldhash::fast::RandomState;

use crate::buffer::ManagedBuffer;
use crate::channel::ChannelId;
use crate::client::TransportClient;
use crate::error::{Result, TransportError};

/// A one-pass sequence of buffers served as chunks.
pub type BufferIter = Box<dyn Iterator<Item = Box<dyn ManagedBuffer>> + Send>;

/// State about streams currently being served to clients.
///
/// Implementations are consulted by the request handler for every chunk
/// fetch and stream open.
pub trait StreamManager: Send + Sync {
    /// Return the chunk at `chunk_index` of stream `stream_id`.
    fn get_chunk(&self, stream_id: u64, chunk_index: i32) -> Result<Box<dyn ManagedBuffer>>;

    /// Open a whole chunk addressed by its canonical text form
    /// `"{stream_id}_{chunk_index}"`.
    fn open_stream(&self, stream_chunk_id: &str) -> Result<Box<dyn ManagedBuffer>>;

    /// Verify the client may read from `stream_id`. Default allows all.
    fn check_authorization(&self, _client: &TransportClient, _stream_id: u64) -> Result<()> {
        Ok(())
    }

    /// Drop every stream associated with the terminated channel and
    /// release its remaining buffers.
    fn connection_terminated(&self, _channel: ChannelId) {}

    fn chunk_being_sent(&self, _stream_id: u64) {}

    fn chunk_sent(&self, _stream_id: u64) {}

    fn stream_being_sent(&self, _stream_id: &str) {}

    fn stream_sent(&self, _stream_id: &str) {}

    /// Total chunks currently in flight across all streams.
    fn chunks_being_transferred(&self) -> u64 {
        0
    }
}

/// Canonical text form of a stream-chunk id.
pub fn gen_stream_chunk_id(stream_id: u64, chunk_index: i32) -> String {
    format!("{stream_id}_{chunk_index}")
}

/// Parse `"{stream_id}_{chunk_index}"` back into its parts.
pub fn parse_stream_chunk_id(stream_chunk_id: &str) -> Result<(u64, i32)> {
    let (stream_id, chunk_index) = stream_chunk_id.split_once('_').ok_or_else(|| {
        TransportError::Stream(format!("malformed stream chunk id {stream_chunk_id}"))
    })?;
    let stream_id = stream_id.parse::<u64>().map_err(|_| {
        TransportError::Stream(format!("malformed stream id in {stream_chunk_id}"))
    })?;
    let chunk_index = chunk_index.parse::<i32>().map_err(|_| {
        TransportError::Stream(format!("malformed chunk index in {stream_chunk_id}"))
    })?;
    Ok((stream_id, chunk_index))
}

struct StreamCursor {
    buffers: Peekable<BufferIter>,
    /// Next chunk index a caller is allowed to request.
    cur_chunk: i32,
}

/// State of a single registered stream.
struct StreamState {
    /// Owning application; when set, only clients with a matching id may
    /// read the stream.
    app_id: Option<String>,
    /// The only channel allowed to consume this stream.
    channel: ChannelId,
    cursor: Mutex<StreamCursor>,
    chunks_being_transferred: AtomicI64,
}

/// Stream manager where each registered buffer is exactly one chunk.
pub struct OneForOneStreamManager {
    next_stream_id: AtomicU64,
    streams: DashMap<u64, Arc<StreamState>, RandomState>,
}

impl OneForOneStreamManager {
    pub fn new() -> Self {
        // Start from a random id so streams of different managers are
        // distinguishable in logs. Uniqueness only matters per manager.
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            next_stream_id: AtomicU64::new((nanos % i32::MAX as u64) * 1000),
            streams: DashMap::default(),
        }
    }

    /// Register a sequence of buffers served one chunk at a time, bound to
    /// `channel` as its only reader. Returns the new stream id.
    ///
    /// Each buffer is dropped after it is handed out; if the channel goes
    /// away first, `connection_terminated` drops whatever remains.
    pub fn register_stream(
        &self,
        app_id: Option<String>,
        buffers: BufferIter,
        channel: ChannelId,
    ) -> u64 {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        self.streams.insert(
            stream_id,
            Arc::new(StreamState {
                app_id,
                channel,
                cursor: Mutex::new(StreamCursor {
                    buffers: buffers.peekable(),
                    cur_chunk: 0,
                }),
                chunks_being_transferred: AtomicI64::new(0),
            }),
        );
        stream_id
    }

    /// Number of streams currently registered.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    fn state(&self, stream_id: u64) -> Result<Arc<StreamState>> {
        self.streams
            .get(&stream_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Stream(format!("unknown stream id {stream_id}")))
    }
}

impl Default for OneForOneStreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamManager for OneForOneStreamManager {
    fn get_chunk(&self, stream_id: u64, chunk_index: i32) -> Result<Box<dyn ManagedBuffer>> {
        let state = self.state(stream_id)?;
        let mut cursor = state.cursor.lock().unwrap();

        if chunk_index != cursor.cur_chunk {
            return Err(TransportError::Stream(format!(
                "received out-of-order chunk index {chunk_index} (expected {})",
                cursor.cur_chunk
            )));
        }
        let Some(buffer) = cursor.buffers.next() else {
            return Err(TransportError::Stream(format!(
                "requested chunk index beyond end {chunk_index}"
            )));
        };
        cursor.cur_chunk += 1;

        if cursor.buffers.peek().is_none() {
            tracing::trace!("removing stream id {stream_id}");
            drop(cursor);
            self.streams.remove(&stream_id);
        }

        Ok(buffer)
    }

    fn open_stream(&self, stream_chunk_id: &str) -> Result<Box<dyn ManagedBuffer>> {
        let (stream_id, chunk_index) = parse_stream_chunk_id(stream_chunk_id)?;
        self.get_chunk(stream_id, chunk_index)
    }

    fn check_authorization(&self, client: &TransportClient, stream_id: u64) -> Result<()> {
        let Some(client_id) = client.client_id() else {
            return Ok(());
        };
        let state = self.state(stream_id)?;
        match &state.app_id {
            Some(app_id) if app_id == client_id => Ok(()),
            app_id => Err(TransportError::Unauthorized(format!(
                "client {client_id} not authorized to read stream {stream_id} (app {app_id:?})"
            ))),
        }
    }

    fn connection_terminated(&self, channel: ChannelId) {
        let doomed: Vec<u64> = self
            .streams
            .iter()
            .filter(|entry| entry.value().channel == channel)
            .map(|entry| *entry.key())
            .collect();

        for stream_id in doomed {
            if let Some((_, state)) = self.streams.remove(&stream_id) {
                tracing::debug!("releasing stream {stream_id} of terminated {channel}");
                let mut cursor = state.cursor.lock().unwrap();
                for buffer in cursor.buffers.by_ref() {
                    drop(buffer);
                }
            }
        }
    }

    fn chunk_being_sent(&self, stream_id: u64) {
        if let Some(state) = self.streams.get(&stream_id) {
            state
                .chunks_being_transferred
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn chunk_sent(&self, stream_id: u64) {
        if let Some(state) = self.streams.get(&stream_id) {
            state
                .chunks_being_transferred
                .fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn stream_being_sent(&self, stream_id: &str) {
        if let Ok((stream_id, _)) = parse_stream_chunk_id(stream_id) {
            self.chunk_being_sent(stream_id);
        }
    }

    fn stream_sent(&self, stream_id: &str) {
        if let Ok((stream_id, _)) = parse_stream_chunk_id(stream_id) {
            self.chunk_sent(stream_id);
        }
    }

    fn chunks_being_transferred(&self) -> u64 {
        let mut sum = 0i64;
        for entry in self.streams.iter() {
            sum += entry.value().chunks_being_transferred.load(Ordering::Relaxed);
        }
        sum.max(0) as u64
    }
}
