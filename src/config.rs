//! Transport configuration.

use std::time::Duration;

/// Default idle threshold before a connection is considered dead.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Default maximum frame size (256 MiB, including the length prefix).
pub const DEFAULT_MAX_FRAME_SIZE: u64 = 256 * 1024 * 1024;

/// Default read buffer size for the inbound loop.
pub const DEFAULT_IO_BUFFER_SIZE: usize = 64 * 1024;

/// Per-connection transport settings.
///
/// Shared by every channel a [`TransportContext`](crate::TransportContext)
/// creates.
#[derive(Debug, Clone)]
pub struct TransportConf {
    /// Idle threshold: a channel with no traffic for longer than this is
    /// closed (or timed out, if requests are in flight).
    pub connection_timeout: Duration,
    /// Maximum accepted frame length, prefix included. Larger frames fail
    /// the channel.
    pub max_frame_size: u64,
    /// Cap on chunks in flight per channel. Exceeding it closes the
    /// channel after the current write completes.
    pub max_chunks_being_transferred: u64,
    /// Size of the buffer handed to each socket read.
    pub io_buffer_size: usize,
}

impl Default for TransportConf {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_chunks_being_transferred: u64::MAX,
            io_buffer_size: DEFAULT_IO_BUFFER_SIZE,
        }
    }
}
