//! TCP server for accepting and managing client connections.
//!
//! Every accepted socket gets its own task. The task owns the connection's
//! [`ConnectionContext`] (session plus reassembly buffer) and drives the
//! pipeline selected for the server's [`TransportProfile`]. A second task
//! per connection drains the outbound queue, so all writes to one socket
//! are serialized without a lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::TextCodec;
use crate::connection::{
    Connection, ConnectionContext, ConnectionId, IdGenerator, Outbound, OutboundQueue,
};
use crate::framing;
use crate::pipeline::{PipelineLimits, ServerPipeline, TransportProfile};
use crate::session::MessageHandler;
use crate::socket::{self, SocketConfig};
use crate::{http_server, websocket};

/// Errors that stop the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("port {} already in use or unavailable on {addr}: {source}", .addr.port())]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// Listener I/O failure after binding.
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error returned when the connection map is at capacity.
#[derive(Debug, thiserror::Error)]
#[error("connection limit of {0} reached")]
pub struct ConnectionLimitReached(pub usize);

/// Thread-safe registry of live connections keyed by [`ConnectionId`].
#[derive(Debug)]
pub struct ConnectionMap {
    inner: RwLock<HashMap<ConnectionId, Connection>>,
    max_connections: usize,
}

impl ConnectionMap {
    /// Create a new map with the given capacity limit.
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    /// Register a connection. Returns `Err` if the map is at capacity.
    pub async fn insert(&self, connection: Connection) -> Result<(), ConnectionLimitReached> {
        let mut map = self.inner.write().await;
        if map.len() >= self.max_connections {
            return Err(ConnectionLimitReached(self.max_connections));
        }
        map.insert(connection.id(), connection);
        Ok(())
    }

    /// Remove a connection by ID.
    pub async fn remove(&self, id: &ConnectionId) -> Option<Connection> {
        self.inner.write().await.remove(id)
    }

    /// Send one marker-wrapped message to every live connection.
    ///
    /// Returns how many connections accepted the write. HTTP connections
    /// deliver it with their next response; a connection whose queue is
    /// full is closed instead.
    pub async fn broadcast(&self, message: &str) -> usize {
        let wire = framing::encode(message);
        let map = self.inner.read().await;
        map.values()
            .filter(|connection| connection.write(wire.clone()))
            .count()
    }

    /// Return the number of active connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Return whether the map is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Configuration for [`GameServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to. Default: `0.0.0.0:7777`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections. Default: 256.
    pub max_connections: usize,
    /// Wire format served on every connection. Default: plain text.
    pub profile: TransportProfile,
    /// Limits enforced by the pipeline.
    pub limits: PipelineLimits,
    /// Options applied to the listener and accepted sockets.
    pub socket: SocketConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7777)),
            max_connections: 256,
            profile: TransportProfile::PlainText,
            limits: PipelineLimits::default(),
            socket: SocketConfig::default(),
        }
    }
}

/// Game server that accepts connections and manages their lifecycle.
pub struct GameServer {
    config: ServerConfig,
    pipeline: ServerPipeline,
    handler: Arc<dyn MessageHandler>,
    connections: Arc<ConnectionMap>,
    id_gen: IdGenerator,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GameServer {
    /// Create a server that hands every message to `handler`.
    pub fn new(config: ServerConfig, handler: Arc<dyn MessageHandler>) -> Self {
        let pipeline = ServerPipeline::select(config.profile, &config.limits);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            connections: Arc::new(ConnectionMap::new(config.max_connections)),
            id_gen: IdGenerator::new(),
            pipeline,
            handler,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// The live connection registry.
    pub fn connections(&self) -> &Arc<ConnectionMap> {
        &self.connections
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.bind_addr;
        socket::create_listener(addr, &self.config.socket).map_err(|source| {
            tracing::error!("Port {} already in use or unavailable: {source}", addr.port());
            ServerError::Bind { addr, source }
        })
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener.
    ///
    /// After [`GameServer::shutdown`] this returns once every connection
    /// task has torn down its session. Dropping the future aborts them.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        tracing::info!(
            "Server listening on {local_addr} ({} profile)",
            self.pipeline.profile()
        );
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = socket::configure_stream(&stream, &self.config.socket) {
                        tracing::warn!("Failed to set socket options for {peer_addr}: {e}");
                    }

                    let id = self.id_gen.next_id();
                    let (connection, outbound) = Connection::new(
                        id,
                        peer_addr,
                        self.config.limits.outbound_queue_capacity,
                    );

                    if let Err(e) = self.connections.insert(connection.clone()).await {
                        tracing::warn!("{e}, rejecting {peer_addr}");
                        continue;
                    }

                    tracing::info!("Accepted connection {id} from {peer_addr}");

                    let ctx = ConnectionContext::new(
                        connection,
                        Arc::clone(&self.handler),
                        self.pipeline.frame_config(),
                    );
                    let pipeline = self.pipeline.clone();
                    let connections = Arc::clone(&self.connections);
                    let task_shutdown = self.shutdown_rx.clone();

                    tasks.spawn(async move {
                        serve_connection(pipeline, stream, ctx, outbound, task_shutdown).await;
                        connections.remove(&id).await;
                        tracing::info!("Connection {id} closed");
                    });
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                changed = shutdown_rx.changed() => {
                    if shutdown_requested(changed, &shutdown_rx) {
                        tracing::info!("Server shutting down");
                        break;
                    }
                }
            }
        }

        if !tasks.is_empty() {
            tracing::info!("Waiting for {} connections to close", tasks.len());
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    /// Signal the server and every connection to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Whether the shutdown signal fired. A dropped sender counts as shutdown.
pub(crate) fn shutdown_requested(
    changed: Result<(), watch::error::RecvError>,
    rx: &watch::Receiver<bool>,
) -> bool {
    changed.is_err() || *rx.borrow()
}

/// Drive one accepted connection with the server's pipeline until it closes.
async fn serve_connection<S>(
    pipeline: ServerPipeline,
    stream: S,
    ctx: ConnectionContext,
    outbound: OutboundQueue,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match pipeline {
        ServerPipeline::PlainText { .. } => {
            serve_plain_text(stream, ctx, outbound, shutdown).await
        }
        ServerPipeline::Http { max_body_size } => {
            http_server::serve(stream, ctx, outbound, max_body_size, shutdown).await
        }
        ServerPipeline::WebSocket {
            path,
            max_message_size,
        } => websocket::serve(stream, ctx, outbound, path, max_message_size, shutdown).await,
    }
}

/// Plain-text driver: UTF-8 decode, marker reassembly, dispatch.
pub(crate) async fn serve_plain_text<S>(
    stream: S,
    mut ctx: ConnectionContext,
    outbound: OutboundQueue,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = ctx.connection().id();
    let abort = ctx.connection().abort_token();
    let (reader, writer) = tokio::io::split(stream);
    let mut units = FramedRead::new(reader, TextCodec::new());
    let writer_task = tokio::spawn(write_text(
        FramedWrite::new(writer, TextCodec::new()),
        outbound,
        id,
    ));

    loop {
        tokio::select! {
            unit = units.next() => match unit {
                Some(Ok(text)) => {
                    tracing::trace!("Connection {id} received {} bytes", text.len());
                    if let Err(e) = ctx.on_text(&text) {
                        tracing::error!("Connection {id} framing fault: {e}");
                        break;
                    }
                    if ctx.is_closed() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::error!("Connection {id} read error: {e}");
                    break;
                }
                None => {
                    tracing::debug!("Connection {id} closed by peer");
                    break;
                }
            },
            changed = shutdown.changed() => {
                if shutdown_requested(changed, &shutdown) {
                    break;
                }
            }
            _ = abort.cancelled() => break,
        }
    }

    ctx.teardown();
    let _ = writer_task.await;
}

/// Writer task for text transports. Ends on [`Outbound::Close`], an abort
/// or a write error. An aborted writer drops the transport without flushing.
pub(crate) async fn write_text<W>(
    mut sink: FramedWrite<W, TextCodec>,
    mut outbound: OutboundQueue,
    id: ConnectionId,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Text(text) => {
                tracing::trace!("Connection {id} writing {} bytes", text.len());
                let result = tokio::select! {
                    result = sink.send(text) => result,
                    _ = outbound.aborted() => return,
                };
                if let Err(e) = result {
                    tracing::error!("Connection {id} write error: {e}");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let result = tokio::select! {
        result = sink.close() => result,
        _ = outbound.aborted() => return,
    };
    if let Err(e) = result {
        tracing::debug!("Connection {id} shutdown error: {e}");
    }
}
