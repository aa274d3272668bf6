//! # gridwire
//!
//! Bidirectional, framed, binary RPC transport for distributed compute
//! nodes. On each connection either endpoint may act as both requester
//! and responder; each side multiplexes single-shot RPCs, one-way
//! messages, chunked stream pulls, and data uploads over one byte pipe.
//!
//! ## Architecture
//!
//! ```text
//! outbound:  TransportClient ─► message codec ─► frame writer ─► pipe
//! inbound:   pipe ─► frame buffer ─► message codec ─► channel handler
//!                                       ├─► request handler  (requests)
//!                                       └─► response handler (responses)
//! ```
//!
//! The transport does not own a listener or a connector: callers bring
//! any `AsyncRead + AsyncWrite` pipe (a TCP stream, a Unix socket, an
//! in-process duplex) and hand it to a [`TransportContext`], which wires
//! the per-connection pipeline and returns the [`TransportClient`] for
//! that channel.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use gridwire::{TransportConf, TransportContext};
//!
//! let context = TransportContext::new(TransportConf::default(), Arc::new(handler));
//! let stream = tokio::net::TcpStream::connect("10.0.0.7:7077").await?;
//! let peer = stream.peer_addr()?.to_string();
//! let client = context.new_client_channel(stream, peer);
//!
//! let reply = client
//!     .send_rpc_sync(request_bytes, std::time::Duration::from_secs(5))
//!     .await?;
//! ```

pub mod protocol;

mod buffer;
pub use buffer::{FileSegmentBuffer, ManagedBuffer, MemoryBuffer};

mod callback;
pub use callback::{
    ChunkReceivedCallback, RpcResponseCallback, StreamCallback, StreamCallbackWithId,
};

mod channel;
pub use channel::{Channel, ChannelId, TransportChannelHandler};

mod client;
pub use client::TransportClient;

mod config;
pub use config::TransportConf;

mod context;
pub use context::TransportContext;

mod error;
pub use error::{Result, TransportError};

mod request;
pub use request::{RpcHandler, TransportRequestHandler};

mod response;
pub use response::TransportResponseHandler;

mod stream;
pub use stream::{
    gen_stream_chunk_id, parse_stream_chunk_id, BufferIter, OneForOneStreamManager, StreamManager,
};

mod writer;
pub use writer::{OutboundFrame, WriteCompletion};
