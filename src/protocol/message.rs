//! Message taxonomy and wire codec.
//!
//! Every message travels as exactly one frame:
//!
//! ```text
//! ┌───────────────┬───────────┬─────────────────┬──────────────┐
//! │ frame length  │ type code │ header fields   │ body         │
//! │ 8 bytes       │ 1 byte    │ per type        │ remainder    │
//! │ i64 BE,       │           │ i32/i64 BE,     │ opaque bytes │
//! │ counts itself │           │ strings len-    │ (may be      │
//! │               │           │ prefixed (i32)  │  absent)     │
//! └───────────────┴───────────┴─────────────────┴──────────────┘
//! ```
//!
//! All multi-byte integers are big-endian. Strings are UTF-8 with an i32
//! byte-length prefix. Stream-chunk ids are `[i64 stream_id][i32 chunk_index]`.
//!
//! Bodies are never copied on encode: [`Message::encode`] returns the
//! prefixed header and the body as two separate `Bytes` regions, and the
//! frame length prefix is composed over their combined size. On decode the
//! remaining frame bytes are wrapped as the body without copying.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};

/// Size of the frame length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Identifies one chunk within one registered stream.
///
/// Canonical text form is `"{stream_id}_{chunk_index}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamChunkId {
    pub stream_id: u64,
    pub chunk_index: i32,
}

impl StreamChunkId {
    pub fn new(stream_id: u64, chunk_index: i32) -> Self {
        Self {
            stream_id,
            chunk_index,
        }
    }
}

impl std::fmt::Display for StreamChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.stream_id, self.chunk_index)
    }
}

/// The complete message set.
///
/// The set partitions into requests (client to server) and responses
/// (server to client); see [`Message::is_request`]. Since either endpoint
/// may act as both requester and responder, "client" here means whichever
/// side sent the request.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Request one chunk from a registered stream.
    ChunkFetchRequest { chunk: StreamChunkId },
    /// Successful chunk delivery.
    ChunkFetchSuccess { chunk: StreamChunkId, body: Bytes },
    /// Chunk could not be served.
    ChunkFetchFailure { chunk: StreamChunkId, error: String },
    /// Opaque RPC expecting exactly one response.
    RpcRequest { request_id: u64, body: Bytes },
    /// Successful RPC reply.
    RpcResponse { request_id: u64, body: Bytes },
    /// RPC failed on the remote side.
    RpcFailure { request_id: u64, error: String },
    /// Open a stream identified by name.
    StreamRequest { stream_id: String },
    /// Stream opened; body carries the stream bytes.
    StreamResponse {
        stream_id: String,
        byte_count: u64,
        body: Bytes,
    },
    /// Stream could not be opened.
    StreamFailure { stream_id: String, error: String },
    /// Fire-and-forget message. No response, no delivery guarantee.
    OneWayMessage { body: Bytes },
    /// Client-to-server data upload: meta is buffered whole, data follows.
    UploadStream {
        request_id: u64,
        meta: Bytes,
        data: Bytes,
    },
}

impl Message {
    /// Single-byte type code carried on the wire.
    pub fn type_code(&self) -> u8 {
        match self {
            Message::ChunkFetchRequest { .. } => 0,
            Message::ChunkFetchSuccess { .. } => 1,
            Message::ChunkFetchFailure { .. } => 2,
            Message::RpcRequest { .. } => 3,
            Message::RpcResponse { .. } => 4,
            Message::RpcFailure { .. } => 5,
            Message::StreamRequest { .. } => 6,
            Message::StreamResponse { .. } => 7,
            Message::StreamFailure { .. } => 8,
            Message::OneWayMessage { .. } => 9,
            Message::UploadStream { .. } => 10,
        }
    }

    /// Whether this message is routed to the request handler (as opposed
    /// to the response handler).
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::ChunkFetchRequest { .. }
                | Message::RpcRequest { .. }
                | Message::StreamRequest { .. }
                | Message::OneWayMessage { .. }
                | Message::UploadStream { .. }
        )
    }

    /// Encode into `(prefixed_header, body)`.
    ///
    /// The header region contains the frame length prefix, the type code,
    /// and the fixed fields. The body region is the message body,
    /// untouched, so the caller can write both with vectored I/O.
    pub fn encode(&self) -> (Bytes, Bytes) {
        let mut header = BytesMut::with_capacity(64);
        // Reserve the prefix slot; patched once the header is complete.
        header.put_i64(0);
        header.put_u8(self.type_code());

        let body = match self {
            Message::ChunkFetchRequest { chunk } => {
                put_chunk_id(&mut header, chunk);
                Bytes::new()
            }
            Message::ChunkFetchSuccess { chunk, body } => {
                put_chunk_id(&mut header, chunk);
                body.clone()
            }
            Message::ChunkFetchFailure { chunk, error } => {
                put_chunk_id(&mut header, chunk);
                put_string(&mut header, error);
                Bytes::new()
            }
            Message::RpcRequest { request_id, body } => {
                header.put_i64(*request_id as i64);
                body.clone()
            }
            Message::RpcResponse { request_id, body } => {
                header.put_i64(*request_id as i64);
                body.clone()
            }
            Message::RpcFailure { request_id, error } => {
                header.put_i64(*request_id as i64);
                put_string(&mut header, error);
                Bytes::new()
            }
            Message::StreamRequest { stream_id } => {
                put_string(&mut header, stream_id);
                Bytes::new()
            }
            Message::StreamResponse {
                stream_id,
                byte_count,
                body,
            } => {
                put_string(&mut header, stream_id);
                header.put_i64(*byte_count as i64);
                body.clone()
            }
            Message::StreamFailure { stream_id, error } => {
                put_string(&mut header, stream_id);
                put_string(&mut header, error);
                Bytes::new()
            }
            Message::OneWayMessage { body } => body.clone(),
            Message::UploadStream {
                request_id,
                meta,
                data,
            } => {
                header.put_i64(*request_id as i64);
                header.put_i32(meta.len() as i32);
                header.put_slice(meta);
                data.clone()
            }
        };

        let frame_len = (header.len() + body.len()) as i64;
        header[..LENGTH_PREFIX_SIZE].copy_from_slice(&frame_len.to_be_bytes());
        (header.freeze(), body)
    }

    /// Decode one frame payload (everything after the length prefix).
    ///
    /// The remaining bytes after the fixed fields become the body without
    /// copying. Unknown type codes and truncated fields are decode errors,
    /// which are fatal to the channel.
    pub fn decode(mut payload: Bytes) -> Result<Message> {
        let code = read_u8(&mut payload)?;
        let message = match code {
            0 => Message::ChunkFetchRequest {
                chunk: read_chunk_id(&mut payload)?,
            },
            1 => Message::ChunkFetchSuccess {
                chunk: read_chunk_id(&mut payload)?,
                body: payload,
            },
            2 => Message::ChunkFetchFailure {
                chunk: read_chunk_id(&mut payload)?,
                error: read_string(&mut payload)?,
            },
            3 => Message::RpcRequest {
                request_id: read_i64(&mut payload)? as u64,
                body: payload,
            },
            4 => Message::RpcResponse {
                request_id: read_i64(&mut payload)? as u64,
                body: payload,
            },
            5 => Message::RpcFailure {
                request_id: read_i64(&mut payload)? as u64,
                error: read_string(&mut payload)?,
            },
            6 => Message::StreamRequest {
                stream_id: read_string(&mut payload)?,
            },
            7 => Message::StreamResponse {
                stream_id: read_string(&mut payload)?,
                byte_count: read_i64(&mut payload)? as u64,
                body: payload,
            },
            8 => Message::StreamFailure {
                stream_id: read_string(&mut payload)?,
                error: read_string(&mut payload)?,
            },
            9 => Message::OneWayMessage { body: payload },
            10 => {
                let request_id = read_i64(&mut payload)? as u64;
                let meta_len = read_i32(&mut payload)?;
                if meta_len < 0 || payload.remaining() < meta_len as usize {
                    return Err(TransportError::Decode(format!(
                        "invalid upload meta length {} ({} bytes remain)",
                        meta_len,
                        payload.remaining()
                    )));
                }
                let meta = payload.split_to(meta_len as usize);
                Message::UploadStream {
                    request_id,
                    meta,
                    data: payload,
                }
            }
            other => {
                return Err(TransportError::Decode(format!(
                    "unknown message type code {other}"
                )))
            }
        };
        Ok(message)
    }
}

fn put_chunk_id(buf: &mut BytesMut, chunk: &StreamChunkId) {
    buf.put_i64(chunk.stream_id as i64);
    buf.put_i32(chunk.chunk_index);
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i32(s.len() as i32);
    buf.put_slice(s.as_bytes());
}

fn read_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated("type code"));
    }
    Ok(buf.get_u8())
}

fn read_i32(buf: &mut Bytes) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(truncated("i32 field"));
    }
    Ok(buf.get_i32())
}

fn read_i64(buf: &mut Bytes) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(truncated("i64 field"));
    }
    Ok(buf.get_i64())
}

fn read_chunk_id(buf: &mut Bytes) -> Result<StreamChunkId> {
    let stream_id = read_i64(buf)? as u64;
    let chunk_index = read_i32(buf)?;
    Ok(StreamChunkId::new(stream_id, chunk_index))
}

fn read_string(buf: &mut Bytes) -> Result<String> {
    let len = read_i32(buf)?;
    if len < 0 || buf.remaining() < len as usize {
        return Err(TransportError::Decode(format!(
            "invalid string length {} ({} bytes remain)",
            len,
            buf.remaining()
        )));
    }
    let raw = buf.split_to(len as usize);
    String::from_utf8(raw.to_vec())
        .map_err(|e| TransportError::Decode(format!("string is not valid UTF-8: {e}")))
}

fn truncated(what: &str) -> TransportError {
    TransportError::Decode(format!("truncated payload while reading {what}"))
}
