//! Channel handle and per-connection glue.
//!
//! A [`Channel`] is the shared handle to one bidirectional byte pipe: it
//! encodes outbound messages into the writer queue and carries the
//! cancellation token that every per-channel task watches. The
//! [`TransportChannelHandler`] glues the inbound side together: it runs
//! the read loop, routes decoded messages to the request or response
//! handler, fans lifecycle events out to both, and watches for idle or
//! stalled connections.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::TransportClient;
use crate::error::TransportError;
use crate::protocol::{FrameBuffer, Message};
use crate::request::{RpcHandler, TransportRequestHandler};
use crate::response::TransportResponseHandler;
use crate::writer::{OutboundFrame, WriteCompletion};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one channel. Streams are bound to it so the
/// registry can sweep them when the connection terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

struct ChannelInner {
    id: ChannelId,
    remote_address: String,
    sender: mpsc::UnboundedSender<OutboundFrame>,
    cancel: CancellationToken,
}

/// Cheap, cloneable handle to one channel's outbound path and lifecycle.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(
        remote_address: impl Into<String>,
        sender: mpsc::UnboundedSender<OutboundFrame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id: ChannelId::next(),
                remote_address: remote_address.into(),
                sender,
                cancel,
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn remote_address(&self) -> &str {
        &self.inner.remote_address
    }

    pub fn is_open(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Initiate teardown. Every per-channel task observes the token; the
    /// read loop then runs the inactive path, failing outstanding work.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Encode `message` and queue it for the writer task. The completion
    /// hook fires exactly once with the write outcome; if the channel is
    /// already closed it fires immediately with an error.
    pub fn write(&self, message: Message, completion: Option<WriteCompletion>) {
        let (header, body) = message.encode();
        let frame = OutboundFrame::new(header, body, completion);

        if !self.is_open() {
            frame.fail(&format!("channel to {} is closed", self.remote_address()));
            return;
        }
        if let Err(send_error) = self.inner.sender.send(frame) {
            send_error
                .0
                .fail(&format!("channel to {} is closed", self.remote_address()));
        }
    }

    #[cfg(test)]
    pub(crate) fn new_detached(
        remote_address: &str,
    ) -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self::new(remote_address, tx, CancellationToken::new());
        (channel, rx)
    }
}

/// Per-connection glue: inbound routing, lifecycle fan-out, idle watch.
pub struct TransportChannelHandler {
    channel: Channel,
    client: Arc<TransportClient>,
    request_handler: TransportRequestHandler,
    response_handler: Arc<TransportResponseHandler>,
    rpc_handler: Arc<dyn RpcHandler>,
    connection_timeout: Duration,
    close_idle_connections: bool,
}

impl TransportChannelHandler {
    pub(crate) fn new(
        channel: Channel,
        client: Arc<TransportClient>,
        request_handler: TransportRequestHandler,
        response_handler: Arc<TransportResponseHandler>,
        rpc_handler: Arc<dyn RpcHandler>,
        connection_timeout: Duration,
        close_idle_connections: bool,
    ) -> Self {
        Self {
            channel,
            client,
            request_handler,
            response_handler,
            rpc_handler,
            connection_timeout,
            close_idle_connections,
        }
    }

    pub fn client(&self) -> &Arc<TransportClient> {
        &self.client
    }

    /// Route one decoded message. Request messages go to the request
    /// handler, responses to the response handler; either way the
    /// activity clock is stamped first.
    fn handle_message(&self, message: Message) -> crate::Result<()> {
        self.response_handler.record_activity();
        if message.is_request() {
            self.request_handler.handle(message)
        } else {
            self.response_handler.handle(message);
            Ok(())
        }
    }

    fn channel_active(&self) {
        tracing::debug!("channel to {} active", self.channel.remote_address());
        self.rpc_handler.channel_active(&self.client);
    }

    fn channel_inactive(&self) {
        tracing::debug!("channel to {} inactive", self.channel.remote_address());
        self.channel.close();

        let remote = self.channel.remote_address().to_owned();
        if self.client.is_timed_out() {
            self.response_handler.fail_outstanding(move || {
                TransportError::Timeout(format!(
                    "connection to {remote} timed out with requests in flight"
                ))
            });
        } else {
            self.response_handler.fail_outstanding(move || {
                TransportError::ChannelClosed(format!("connection to {remote} closed"))
            });
        }

        self.rpc_handler
            .stream_manager()
            .connection_terminated(self.channel.id());
        self.rpc_handler.channel_inactive(&self.client);
    }

    fn exception_caught(&self, error: &TransportError) {
        tracing::error!(
            "exception on channel to {}: {error}",
            self.channel.remote_address()
        );
        self.rpc_handler.exception_caught(error, &self.client);
        // The inactive path that follows fails outstanding callbacks and
        // rejects further inbound frames.
        self.channel.close();
    }

    /// Inbound loop: read, reassemble frames, decode, route. Runs until
    /// EOF, a fatal error, or channel close, then runs the inactive path.
    pub(crate) async fn run<R>(self: Arc<Self>, mut reader: R, max_frame_size: u64, buf_size: usize)
    where
        R: AsyncRead + Unpin,
    {
        let cancel = self.channel.cancellation();
        let mut frame_buffer = FrameBuffer::with_max_frame_size(max_frame_size);
        let mut buf = vec![0u8; buf_size];

        self.channel_active();

        'read: loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'read,
                read = reader.read(&mut buf) => read,
            };
            let payloads = match read {
                Ok(0) => break 'read,
                Ok(n) => match frame_buffer.push(&buf[..n]) {
                    Ok(payloads) => payloads,
                    Err(e) => {
                        self.exception_caught(&e);
                        break 'read;
                    }
                },
                Err(e) => {
                    self.exception_caught(&TransportError::Io(e));
                    break 'read;
                }
            };
            for payload in payloads {
                let message = match Message::decode(payload) {
                    Ok(message) => message,
                    Err(e) => {
                        self.exception_caught(&e);
                        break 'read;
                    }
                };
                if let Err(e) = self.handle_message(message) {
                    self.exception_caught(&e);
                    break 'read;
                }
            }
        }

        self.channel_inactive();
    }

    /// Watchdog closing idle or stalled connections.
    ///
    /// A channel quiet past the connection timeout with requests in
    /// flight is assumed dead: the client is marked timed out and the
    /// channel closed, which fails all of its callbacks. A quiet channel
    /// with nothing in flight is closed only when idle-close is enabled.
    pub(crate) async fn idle_watchdog(self: Arc<Self>) {
        let cancel = self.channel.cancellation();
        let period = (self.connection_timeout / 2).max(Duration::from_millis(5));
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if self.response_handler.time_since_last_activity() <= self.connection_timeout {
                continue;
            }
            let outstanding = self.response_handler.outstanding_requests();
            if outstanding > 0 {
                tracing::error!(
                    "connection to {} has been quiet for {:?} with {outstanding} outstanding \
                     requests, assuming it is dead",
                    self.channel.remote_address(),
                    self.connection_timeout
                );
                self.client.time_out();
                self.channel.close();
                return;
            }
            if self.close_idle_connections {
                tracing::debug!(
                    "closing idle connection to {}",
                    self.channel.remote_address()
                );
                self.channel.close();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_ids_are_unique() {
        let a = ChannelId::next();
        let b = ChannelId::next();
        assert_ne!(a, b);
        assert_eq!(format!("{a}"), format!("channel-{}", a.0));
    }

    #[test]
    fn test_closed_channel_fails_writes_immediately() {
        let (channel, _rx) = Channel::new_detached("remote:9");
        channel.close();
        assert!(!channel.is_open());

        let failed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let failed2 = failed.clone();
        channel.write(
            Message::OneWayMessage {
                body: bytes::Bytes::from_static(b"x"),
            },
            Some(Box::new(move |result| {
                failed2.store(result.is_err(), Ordering::SeqCst);
            })),
        );
        assert!(failed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_write_enqueues_encoded_frame() {
        let (channel, mut rx) = Channel::new_detached("remote:9");
        channel.write(
            Message::RpcRequest {
                request_id: 3,
                body: bytes::Bytes::from_static(b"hello"),
            },
            None,
        );
        let frame = rx.try_recv().unwrap();
        // Length prefix counts itself: 8 + 1 type + 8 id + 5 body.
        assert_eq!(frame.size(), 22);
    }
}
