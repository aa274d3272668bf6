//! Wire protocol: message taxonomy, binary codec, and framing.
//!
//! Outbound, a [`Message`] encodes to a prefixed header plus a body region
//! ([`Message::encode`]); inbound, a [`FrameBuffer`] reassembles frames
//! from partial reads and [`Message::decode`] turns each payload back
//! into a typed message.

mod frame_buffer;
mod message;

pub use frame_buffer::FrameBuffer;
pub use message::{Message, StreamChunkId, LENGTH_PREFIX_SIZE};
