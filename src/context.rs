//! Per-connection pipeline assembly.
//!
//! A [`TransportContext`] holds the configuration and the embedder's
//! [`RpcHandler`], and turns any bidirectional byte pipe into a fully
//! wired channel: writer task on the outbound side; frame reassembly,
//! message decoding, and routing on the inbound side; plus the idle
//! watchdog. Each channel gets a paired client and handler set; the
//! request handler receives the same client instance (the reverse
//! client) so the server side can talk back to the requester.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, TransportChannelHandler};
use crate::client::TransportClient;
use crate::config::TransportConf;
use crate::request::{RpcHandler, TransportRequestHandler};
use crate::response::TransportResponseHandler;
use crate::writer::spawn_writer_task;

/// Factory for transport channels over arbitrary byte pipes.
pub struct TransportContext {
    conf: TransportConf,
    rpc_handler: Arc<dyn RpcHandler>,
    close_idle_connections: bool,
}

impl TransportContext {
    pub fn new(conf: TransportConf, rpc_handler: Arc<dyn RpcHandler>) -> Self {
        Self::with_idle_close(conf, rpc_handler, false)
    }

    pub fn with_idle_close(
        conf: TransportConf,
        rpc_handler: Arc<dyn RpcHandler>,
        close_idle_connections: bool,
    ) -> Self {
        Self {
            conf,
            rpc_handler,
            close_idle_connections,
        }
    }

    pub fn conf(&self) -> &TransportConf {
        &self.conf
    }

    /// Wire up a channel whose byte pipe came from an accept.
    pub fn new_server_channel<S>(
        &self,
        io: S,
        remote_address: impl Into<String>,
    ) -> Arc<TransportClient>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let remote_address = remote_address.into();
        tracing::debug!("accepted connection from {remote_address}");
        self.initialize_pipeline(io, remote_address)
    }

    /// Wire up a channel whose byte pipe came from a connect.
    pub fn new_client_channel<S>(
        &self,
        io: S,
        remote_address: impl Into<String>,
    ) -> Arc<TransportClient>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let remote_address = remote_address.into();
        tracing::debug!("connected to {remote_address}");
        self.initialize_pipeline(io, remote_address)
    }

    /// Assemble the fixed pipeline for one connection and spawn its
    /// tasks. Returns the client half, which shares the channel with the
    /// handlers.
    fn initialize_pipeline<S>(&self, io: S, remote_address: String) -> Arc<TransportClient>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);

        let cancel = CancellationToken::new();
        let (sender, _writer_task) = spawn_writer_task(write_half, cancel.clone());
        let channel = Channel::new(remote_address.clone(), sender, cancel);

        let response_handler = Arc::new(TransportResponseHandler::new(remote_address));
        let client = Arc::new(TransportClient::new(
            channel.clone(),
            response_handler.clone(),
        ));
        let request_handler = TransportRequestHandler::new(
            channel.clone(),
            client.clone(),
            self.rpc_handler.clone(),
            self.conf.max_chunks_being_transferred,
        );
        let handler = Arc::new(TransportChannelHandler::new(
            channel,
            client.clone(),
            request_handler,
            response_handler,
            self.rpc_handler.clone(),
            self.conf.connection_timeout,
            self.close_idle_connections,
        ));

        tokio::spawn(handler.clone().run(
            read_half,
            self.conf.max_frame_size,
            self.conf.io_buffer_size,
        ));
        tokio::spawn(handler.idle_watchdog());

        client
    }
}
