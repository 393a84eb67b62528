//! Connection handles and the per-connection state shared by every transport driver.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::framing::{FrameAssembler, FrameConfig, FrameError};
use crate::session::{MessageHandler, Session};

/// Unique identifier for a connection within a server or client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Work item for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Wire text, written in one piece.
    Text(String),
    /// Flush what is queued, then close the transport.
    Close,
}

/// Cloneable handle used to write to a live connection.
///
/// Writes are queued to the connection's single writer task, so the order
/// of calls is the order on the wire and one call is one transport write.
/// The queue is bounded: a peer that stops reading until it fills is cut
/// off instead of buffering without limit.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    tx: mpsc::Sender<Outbound>,
    abort: CancellationToken,
}

impl Connection {
    /// Create a handle and the queue its writer task drains. At most
    /// `capacity` writes wait in the queue.
    pub fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        capacity: usize,
    ) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let abort = CancellationToken::new();
        (
            Self {
                id,
                remote_addr,
                tx,
                abort: abort.clone(),
            },
            OutboundQueue { rx, abort },
        )
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Address of the peer.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Queue wire text. Returns `false` if the writer is gone or the queue
    /// is full, in which case the connection is aborted.
    pub fn write(&self, text: impl Into<String>) -> bool {
        self.enqueue(Outbound::Text(text.into()))
    }

    /// Ask the writer task to close the transport.
    pub fn close(&self) {
        self.enqueue(Outbound::Close);
    }

    /// Whether the writer task is still accepting work.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed() && !self.abort.is_cancelled()
    }

    /// Token cancelled when the connection is aborted. Readers select on it.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    fn enqueue(&self, item: Outbound) -> bool {
        if self.abort.is_cancelled() {
            return false;
        }
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    "Connection {} outbound queue full, closing slow peer",
                    self.id
                );
                self.abort.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Receiving end of a connection's outbound queue.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Outbound>,
    abort: CancellationToken,
}

impl OutboundQueue {
    /// Next queued item. `None` once every handle is gone or the connection
    /// was aborted; queued items are discarded on abort.
    pub async fn recv(&mut self) -> Option<Outbound> {
        tokio::select! {
            biased;
            _ = self.abort.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    /// Resolves once the connection is aborted.
    pub async fn aborted(&self) {
        self.abort.cancelled().await;
    }

    /// Take a queued item without waiting.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        if self.abort.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }
}

/// State owned by one connection's reader: its session, its reassembly
/// buffer and the shared handler.
///
/// The session is created on the first inbound unit, never before.
pub struct ConnectionContext {
    connection: Connection,
    session: Option<Session>,
    assembler: FrameAssembler,
    handler: Arc<dyn MessageHandler>,
    torn_down: bool,
}

impl ConnectionContext {
    /// Create the context for a freshly accepted connection.
    pub fn new(connection: Connection, handler: Arc<dyn MessageHandler>, frame: FrameConfig) -> Self {
        Self {
            connection,
            session: None,
            assembler: FrameAssembler::new(frame),
            handler,
            torn_down: false,
        }
    }

    /// The connection handle.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The session, if any data has arrived yet.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Return the session, creating an anonymous one on first use.
    pub fn session_or_create(&mut self) -> &mut Session {
        self.session.get_or_insert_with(|| {
            tracing::debug!("Connection {} opened anonymous session", self.connection.id());
            Session::anonymous(self.connection.clone())
        })
    }

    /// Feed one decoded text unit through marker reassembly and dispatch
    /// every completed message.
    pub fn on_text(&mut self, unit: &str) -> Result<(), FrameError> {
        self.session_or_create();
        let messages = self.assembler.push(unit)?;
        for message in messages {
            if self.is_closed() {
                tracing::debug!(
                    "Connection {} closed mid-batch, dropping remaining messages",
                    self.connection.id()
                );
                break;
            }
            self.dispatch(&message);
        }
        Ok(())
    }

    /// Dispatch one already-delimited message.
    pub fn on_message(&mut self, message: &str) {
        self.session_or_create();
        if !self.is_closed() {
            self.dispatch(message);
        }
    }

    /// Whether the session was closed or the connection torn down.
    pub fn is_closed(&self) -> bool {
        self.torn_down || self.session.as_ref().is_some_and(Session::is_closed)
    }

    /// Close the session and release the connection. Safe to call repeatedly;
    /// the handler hears about the closed session exactly once.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.assembler.clear();
        match self.session.as_mut() {
            Some(session) => {
                session.disconnect();
                self.handler.session_closed(session);
            }
            None => self.connection.close(),
        }
    }

    fn dispatch(&mut self, message: &str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        tracing::trace!(
            "Connection {} dispatching {} bytes as {}",
            session.id(),
            message.len(),
            session.identity()
        );
        self.handler.process_message(session, message);
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("connection", &self.connection)
            .field("session", &self.session)
            .field("pending", &self.assembler.pending_len())
            .field("torn_down", &self.torn_down)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Identity, PlayerId, SessionState};
    use crate::testing::Recorder;

    fn context(handler: Arc<dyn MessageHandler>) -> (ConnectionContext, OutboundQueue) {
        let (connection, rx) = Connection::new(ConnectionId(7), "127.0.0.1:5000".parse().unwrap(), 16);
        (ConnectionContext::new(connection, handler, FrameConfig::default()), rx)
    }

    #[test]
    fn test_connection_id_uniqueness() {
        let id_gen = IdGenerator::new();
        let id1 = id_gen.next_id();
        let id2 = id_gen.next_id();
        let id3 = id_gen.next_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.0 + 1, id2.0);
        assert_eq!(id2.0 + 1, id3.0);
    }

    #[test]
    fn test_no_session_before_data() {
        let recorder = Recorder::new();
        let (ctx, _rx) = context(recorder.clone());
        assert!(ctx.session().is_none());
        assert!(!ctx.is_closed());
    }

    #[test]
    fn test_session_created_on_first_fragment() {
        let recorder = Recorder::new();
        let (mut ctx, _rx) = context(recorder.clone());

        ctx.on_text("#hel").unwrap();
        let session = ctx.session().unwrap();
        assert_eq!(session.state(), SessionState::Anonymous);
        assert_eq!(session.identity(), Identity::World);
        assert!(recorder.messages().is_empty());

        ctx.on_text("lo$").unwrap();
        assert_eq!(recorder.messages(), vec!["hello"]);
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let recorder = Recorder::new();
        let (mut ctx, _rx) = context(recorder);
        ctx.session_or_create().authenticate(PlayerId(5)).unwrap();
        let again = ctx.session_or_create();
        assert_eq!(again.identity(), Identity::Player(PlayerId(5)));
    }

    #[test]
    fn test_batch_dispatched_in_order() {
        let recorder = Recorder::new();
        let (mut ctx, _rx) = context(recorder.clone());
        ctx.on_text("#a$#b$#c$").unwrap();
        assert_eq!(recorder.messages(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_handler_disconnect_stops_batch() {
        let recorder = Recorder::disconnecting_on("quit");
        let (mut ctx, mut rx) = context(recorder.clone());
        ctx.on_text("#one$#quit$#two$").unwrap();

        assert_eq!(recorder.messages(), vec!["one", "quit"]);
        assert!(ctx.is_closed());
        assert_eq!(rx.try_recv(), Some(Outbound::Close));
    }

    #[test]
    fn test_overflow_is_reported() {
        let recorder = Recorder::new();
        let (connection, _rx) = Connection::new(ConnectionId(1), "127.0.0.1:1".parse().unwrap(), 16);
        let mut ctx = ConnectionContext::new(
            connection,
            recorder.clone(),
            FrameConfig {
                max_pending_size: 4,
            },
        );
        assert!(matches!(
            ctx.on_text("#toolong"),
            Err(FrameError::PendingOverflow { .. })
        ));
        assert!(recorder.messages().is_empty());
    }

    #[test]
    fn test_on_message_skips_reassembly() {
        let recorder = Recorder::new();
        let (mut ctx, _rx) = context(recorder.clone());
        ctx.on_message("raw$text");
        assert_eq!(recorder.messages(), vec!["raw$text"]);
    }

    #[test]
    fn test_teardown_notifies_once() {
        let recorder = Recorder::new();
        let (mut ctx, mut rx) = context(recorder.clone());
        ctx.on_text("#x$").unwrap();

        ctx.teardown();
        ctx.teardown();

        assert_eq!(recorder.closed(), 1);
        assert_eq!(ctx.session().unwrap().state(), SessionState::Closed);
        assert_eq!(rx.try_recv(), Some(Outbound::Close));
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn test_teardown_without_session_closes_connection() {
        let recorder = Recorder::new();
        let (mut ctx, mut rx) = context(recorder.clone());
        ctx.teardown();
        assert_eq!(recorder.closed(), 0);
        assert_eq!(rx.try_recv(), Some(Outbound::Close));
        assert!(ctx.is_closed());
    }

    #[test]
    fn test_write_after_receiver_dropped() {
        let (connection, rx) = Connection::new(ConnectionId(2), "127.0.0.1:1".parse().unwrap(), 4);
        assert!(connection.is_open());
        drop(rx);
        assert!(!connection.write("#late$"));
        assert!(!connection.is_open());
    }

    #[tokio::test]
    async fn test_full_queue_aborts_connection() {
        let (connection, mut queue) =
            Connection::new(ConnectionId(3), "127.0.0.1:1".parse().unwrap(), 2);
        assert!(connection.write("#1$"));
        assert!(connection.write("#2$"));
        assert!(!connection.write("#3$"), "Third write should overflow the queue");

        assert!(!connection.is_open());
        assert!(connection.abort_token().is_cancelled());
        assert!(!connection.write("#4$"));
        assert_eq!(queue.recv().await, None, "Aborted queue should stop the writer");
    }

    #[tokio::test]
    async fn test_queue_drains_in_order_until_handles_drop() {
        let (connection, mut queue) =
            Connection::new(ConnectionId(4), "127.0.0.1:1".parse().unwrap(), 8);
        connection.write("#a$");
        connection.close();
        drop(connection);

        assert_eq!(queue.recv().await, Some(Outbound::Text("#a$".into())));
        assert_eq!(queue.recv().await, Some(Outbound::Close));
        assert_eq!(queue.recv().await, None);
    }
}
