//! Client for connecting to an Ember game server.
//!
//! Manages the connection lifecycle: connecting with an optional timeout,
//! the WebSocket upgrade when that profile is selected, inbound message
//! reassembly and clean disconnect. Lifecycle changes are reported as
//! [`ClientEvent`]s on a bounded channel, and the coarse state is observable
//! through a [`watch`] channel so any number of consumers can react without
//! polling.
//!
//! A full event channel pauses the connection's reader until the
//! application catches up. A full outbound queue closes the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role as WsRole;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::TextCodec;
use crate::connection::{Connection, ConnectionId, IdGenerator, OutboundQueue};
use crate::framing::{self, FrameAssembler, FrameConfig};
use crate::handshake::{ClientHandshake, HandshakeError, HandshakeProgress};
use crate::pipeline::{ClientPipeline, PipelineError, PipelineLimits, TransportProfile};
use crate::rewind::Rewind;
use crate::socket::{self, SocketConfig};
use crate::tcp_server::{shutdown_requested, write_text};
use crate::websocket;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Attempting to establish a TCP connection.
    Connecting,
    /// TCP connection established, ready for communication.
    Connected,
    /// Connection lost or intentionally closed.
    Disconnected,
}

/// Observable connection state backed by a [`watch`] channel.
///
/// Multiple subscribers can observe state transitions without polling.
#[derive(Debug)]
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current connection state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_replace(state);
    }

    /// Move from `from` to `to` atomically. Returns `false`, changing
    /// nothing, if the current state is not `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Notifications delivered to the application owning a [`GameClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The transport connection was established.
    ConnectionComplete,
    /// A connection attempt failed. Sent exactly once per failed attempt.
    ConnectionFailed,
    /// An established connection ended. Sent at most once per connection.
    ConnectionLost,
    /// The WebSocket upgrade was accepted by the server.
    HandshakeComplete,
    /// One reassembled inbound application message.
    MessageReceived(String),
}

/// Errors returned by [`GameClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The connection attempt did not finish in time.
    #[error("connection to {addr} timed out after {timeout:?}")]
    Timeout {
        /// Target `host:port`.
        addr: String,
        /// The configured timeout.
        timeout: Duration,
    },
    /// The connection attempt was refused or failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Target `host:port`.
        addr: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// The profile has no client pipeline.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    /// The WebSocket upgrade failed.
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
}

/// Configuration for [`GameClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Wire format used on the connection. Default: plain text.
    pub profile: TransportProfile,
    /// Bound on the connection attempt. `None` waits for the OS. Default: 5s.
    pub connect_timeout: Option<Duration>,
    /// Limits enforced by the pipeline.
    pub limits: PipelineLimits,
    /// Options applied to the connected socket.
    pub socket: SocketConfig,
    /// Capacity of the event channel. Default: 256.
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            profile: TransportProfile::PlainText,
            connect_timeout: Some(Duration::from_secs(5)),
            limits: PipelineLimits::default(),
            socket: SocketConfig::default(),
            event_buffer: 256,
        }
    }
}

/// Client side of a game connection.
///
/// Created via [`GameClient::new`], which also returns the event receiver.
/// At most one connection is live at a time.
pub struct GameClient {
    config: ClientConfig,
    pipeline: ClientPipeline,
    state: Arc<ConnectionStateWatch>,
    events: mpsc::Sender<ClientEvent>,
    id_gen: IdGenerator,
    connection: Option<Connection>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl GameClient {
    /// Create a disconnected client.
    pub fn new(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>), ClientError> {
        let pipeline = ClientPipeline::select(config.profile, &config.limits)?;
        let (events, events_rx) = mpsc::channel(config.event_buffer.max(1));
        Ok((
            Self {
                config,
                pipeline,
                state: Arc::new(ConnectionStateWatch::new()),
                events,
                id_gen: IdGenerator::new(),
                connection: None,
                shutdown_tx: None,
                task: None,
            },
            events_rx,
        ))
    }

    /// Return the connection state watch.
    pub fn state(&self) -> &Arc<ConnectionStateWatch> {
        &self.state
    }

    /// Whether a connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some() && self.state.current() == ConnectionState::Connected
    }

    /// Connect to `address:port`, waiting for the attempt to finish.
    ///
    /// Emits [`ClientEvent::ConnectionComplete`] on success and
    /// [`ClientEvent::ConnectionFailed`] on failure. A live connection is
    /// closed first.
    pub async fn connect(&mut self, address: &str, port: u16) -> Result<(), ClientError> {
        if self.connection.is_some() {
            self.close().await;
        }

        let addr = format!("{address}:{port}");
        self.state.set(ConnectionState::Connecting);
        tracing::info!("Connecting to {addr} ({} profile)", self.pipeline.profile());

        let (stream, remote) = match self.open(address, port, &addr).await {
            Ok(opened) => opened,
            Err(e) => {
                tracing::error!("{e}");
                self.state.set(ConnectionState::Disconnected);
                self.emit(ClientEvent::ConnectionFailed).await;
                return Err(e);
            }
        };

        let id = self.id_gen.next_id();
        let (connection, outbound) =
            Connection::new(id, remote, self.config.limits.outbound_queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.state.set(ConnectionState::Connected);
        tracing::info!("Connection {id} established to {remote}");
        self.emit(ClientEvent::ConnectionComplete).await;

        let link = Link {
            connection: connection.clone(),
            events: self.events.clone(),
            state: Arc::clone(&self.state),
            shutdown: shutdown_rx.clone(),
        };
        let task = match self.pipeline.clone() {
            ClientPipeline::WebSocket {
                path,
                max_response_size,
                frame,
            } => tokio::spawn(run_websocket(
                stream,
                remote,
                path,
                max_response_size,
                frame,
                outbound,
                link,
                shutdown_rx,
            )),
            ClientPipeline::PlainText { frame } => tokio::spawn(run_plain_text(
                stream,
                frame,
                outbound,
                link,
                shutdown_rx,
            )),
        };

        self.connection = Some(connection);
        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(task);
        Ok(())
    }

    /// Send one message. Silently dropped when not connected.
    pub fn send_message(&self, message: &str) {
        let Some(connection) = self.live_connection() else {
            tracing::trace!("Not connected, dropping outbound message");
            return;
        };
        match self.pipeline {
            ClientPipeline::WebSocket { .. } => connection.write(message),
            ClientPipeline::PlainText { .. } => connection.write(framing::encode(message)),
        };
    }

    /// Send several messages in order. Plain text goes out as one write;
    /// WebSocket sends one text frame per message.
    pub fn send_messages<I, S>(&self, messages: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let Some(connection) = self.live_connection() else {
            tracing::trace!("Not connected, dropping outbound messages");
            return;
        };
        match self.pipeline {
            ClientPipeline::WebSocket { .. } => {
                for message in messages {
                    if !connection.write(message.as_ref()) {
                        break;
                    }
                }
            }
            ClientPipeline::PlainText { .. } => {
                let wire = framing::encode_all(messages);
                if !wire.is_empty() {
                    connection.write(wire);
                }
            }
        }
    }

    /// Close the connection. Emits [`ClientEvent::ConnectionLost`] if a
    /// connection existed; a no-op otherwise.
    pub async fn close(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        connection.close();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if self
            .state
            .transition(ConnectionState::Connected, ConnectionState::Disconnected)
        {
            tracing::info!("Connection {} closed", connection.id());
            self.emit(ClientEvent::ConnectionLost).await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Alias for [`GameClient::close`].
    pub async fn disconnect(&mut self) {
        self.close().await;
    }

    async fn open(
        &self,
        address: &str,
        port: u16,
        addr: &str,
    ) -> Result<(TcpStream, SocketAddr), ClientError> {
        let attempt = TcpStream::connect((address, port));
        let result = match self.config.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, attempt).await.map_err(|_| {
                ClientError::Timeout {
                    addr: addr.to_string(),
                    timeout,
                }
            })?,
            None => attempt.await,
        };
        let connect_error = |source| ClientError::Connect {
            addr: addr.to_string(),
            source,
        };
        let stream = result.map_err(connect_error)?;
        let remote = stream.peer_addr().map_err(connect_error)?;
        if let Err(e) = socket::configure_stream(&stream, &self.config.socket) {
            tracing::warn!("Failed to set socket options for {addr}: {e}");
        }
        Ok((stream, remote))
    }

    fn live_connection(&self) -> Option<&Connection> {
        self.connection
            .as_ref()
            .filter(|_| self.state.current() == ConnectionState::Connected)
    }

    async fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event).await;
    }
}

impl Drop for GameClient {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }
}

/// What a connection task needs to report back to its client.
struct Link {
    connection: Connection,
    events: mpsc::Sender<ClientEvent>,
    state: Arc<ConnectionStateWatch>,
    shutdown: watch::Receiver<bool>,
}

impl Link {
    fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Wait for room on the event channel. Gives up once the client closes.
    async fn emit(&self, event: ClientEvent) {
        tokio::select! {
            biased;
            _ = stopped(self.shutdown.clone()) => {}
            _ = self.events.send(event) => {}
        }
    }

    /// Feed one inbound text unit through reassembly. Returns `false` on a framing fault.
    async fn deliver(&self, assembler: &mut FrameAssembler, unit: &str) -> bool {
        match assembler.push(unit) {
            Ok(messages) => {
                for message in messages {
                    self.emit(ClientEvent::MessageReceived(message)).await;
                }
                true
            }
            Err(e) => {
                tracing::error!("Connection {} framing fault: {e}", self.id());
                false
            }
        }
    }

    /// Stop the writer and report the loss unless the client already closed.
    async fn finish(self, writer: Option<JoinHandle<()>>) {
        self.connection.close();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        if self
            .state
            .transition(ConnectionState::Connected, ConnectionState::Disconnected)
        {
            tracing::info!("Connection {} lost", self.id());
            self.emit(ClientEvent::ConnectionLost).await;
        }
    }
}

/// Resolves once `shutdown` is set or its sender is gone.
async fn stopped(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn run_plain_text(
    stream: TcpStream,
    frame: FrameConfig,
    outbound: OutboundQueue,
    link: Link,
    mut shutdown: watch::Receiver<bool>,
) {
    let id = link.id();
    let abort = link.connection.abort_token();
    let (reader, writer) = stream.into_split();
    let mut units = FramedRead::new(reader, TextCodec::new());
    let writer_task = tokio::spawn(write_text(
        FramedWrite::new(writer, TextCodec::new()),
        outbound,
        id,
    ));
    let mut assembler = FrameAssembler::new(frame);

    loop {
        tokio::select! {
            unit = units.next() => match unit {
                Some(Ok(text)) => {
                    if !link.deliver(&mut assembler, &text).await {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::error!("Connection {id} read error: {e}");
                    break;
                }
                None => break,
            },
            changed = shutdown.changed() => {
                if shutdown_requested(changed, &shutdown) {
                    break;
                }
            }
            _ = abort.cancelled() => break,
        }
    }

    link.finish(Some(writer_task)).await;
}

#[allow(clippy::too_many_arguments)]
async fn run_websocket(
    mut stream: TcpStream,
    remote: SocketAddr,
    path: &'static str,
    max_response_size: usize,
    frame: FrameConfig,
    outbound: OutboundQueue,
    link: Link,
    mut shutdown: watch::Receiver<bool>,
) {
    let id = link.id();
    let abort = link.connection.abort_token();
    let mut handshake = ClientHandshake::new(max_response_size);

    let leftover = match upgrade(&mut stream, &mut handshake, remote, path, &mut shutdown).await {
        Ok(Some(leftover)) => leftover,
        Ok(None) => return link.finish(None).await,
        Err(e) => {
            tracing::error!("Connection {id} {e}");
            return link.finish(None).await;
        }
    };
    link.emit(ClientEvent::HandshakeComplete).await;

    let ws = WebSocketStream::from_raw_socket(
        Rewind::new(stream, leftover),
        WsRole::Client,
        Some(websocket::frame_config(frame.max_pending_size)),
    )
    .await;
    let (sink, mut frames) = ws.split();
    let writer_task = tokio::spawn(websocket::write_frames(sink, outbound, id));
    let mut assembler = FrameAssembler::new(frame);

    loop {
        tokio::select! {
            message = frames.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if !link.deliver(&mut assembler, text.as_str()).await {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    tracing::warn!("Connection {id} dropping {} byte binary frame", data.len());
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!("Connection {id} WebSocket error: {e}");
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

    link.finish(Some(writer_task)).await;
}

/// Drive the upgrade exchange. `Ok(None)` means the connection ended first.
async fn upgrade(
    stream: &mut TcpStream,
    handshake: &mut ClientHandshake,
    remote: SocketAddr,
    path: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<Vec<u8>>, ClientError> {
    let request = handshake.start(remote, path)?;
    if let Err(e) = stream.write_all(&request).await {
        tracing::error!("Failed to send upgrade request: {e}");
        return Ok(None);
    }

    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::warn!("Connection closed during WebSocket handshake");
                    return Ok(None);
                }
                Ok(n) => match handshake.feed(&buf[..n])? {
                    HandshakeProgress::Complete { leftover } => return Ok(Some(leftover)),
                    HandshakeProgress::NeedMore | HandshakeProgress::Discarded => {}
                },
                Err(e) => {
                    tracing::error!("Read failed during WebSocket handshake: {e}");
                    return Ok(None);
                }
            },
            changed = shutdown.changed() => {
                if shutdown_requested(changed, shutdown) {
                    return Ok(None);
                }
            }
        }
    }
}
