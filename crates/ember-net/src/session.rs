//! Per-connection session state and the business-handler seam.
//!
//! A [`Session`] is bound to exactly one [`Connection`] for its whole life.
//! It starts anonymous under the world identity, may be authenticated once,
//! and ends closed:
//!
//! ```text
//! Anonymous --authenticate()--> Authenticated
//!     |                               |
//!     +-----------disconnect()--------+--> Closed
//! ```

use std::fmt;

use crate::connection::{Connection, ConnectionId};
use crate::framing;

/// Identifier of an authenticated player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlayerId(pub u64);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player#{}", self.0)
    }
}

/// Who a session speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Anonymous sessions act on behalf of the world.
    World,
    /// A concrete, authenticated player.
    Player(PlayerId),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::World => f.write_str("world"),
            Self::Player(id) => id.fmt(f),
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created on first inbound data, bound to [`Identity::World`].
    Anonymous,
    /// Bound to a player by the authentication collaborator.
    Authenticated,
    /// Terminal. Nothing is sent once here.
    Closed,
}

/// Errors returned by session transitions.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session already carries a player identity.
    #[error("session is already authenticated as {0}")]
    AlreadyAuthenticated(Identity),
    /// The session has been closed.
    #[error("session is closed")]
    Closed,
}

/// One logical conversation over one connection.
#[derive(Debug)]
pub struct Session {
    connection: Connection,
    identity: Identity,
    state: SessionState,
}

impl Session {
    /// Create an anonymous session bound to the world identity.
    pub fn anonymous(connection: Connection) -> Self {
        Self {
            connection,
            identity: Identity::World,
            state: SessionState::Anonymous,
        }
    }

    /// Identifier of the underlying connection.
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Current identity.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The owning connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Bind the session to `player`. Allowed once, from the anonymous state only.
    pub fn authenticate(&mut self, player: PlayerId) -> Result<(), SessionError> {
        match self.state {
            SessionState::Anonymous => {
                self.identity = Identity::Player(player);
                self.state = SessionState::Authenticated;
                tracing::info!("Connection {} authenticated as {player}", self.id());
                Ok(())
            }
            SessionState::Authenticated => Err(SessionError::AlreadyAuthenticated(self.identity)),
            SessionState::Closed => Err(SessionError::Closed),
        }
    }

    /// Send one message. Dropped silently once the session is closed.
    pub fn send_message(&self, message: &str) {
        if self.is_closed() {
            tracing::trace!("Connection {} closed, dropping outbound message", self.id());
            return;
        }
        self.connection.write(framing::encode(message));
    }

    /// Send several messages as a single write, in the given order.
    pub fn send_messages<I, S>(&self, messages: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.is_closed() {
            tracing::trace!("Connection {} closed, dropping outbound messages", self.id());
            return;
        }
        let wire = framing::encode_all(messages);
        if !wire.is_empty() {
            self.connection.write(wire);
        }
    }

    /// Close the session and release the connection.
    ///
    /// Returns `true` on the call that actually closed it; later calls are no-ops.
    pub fn disconnect(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = SessionState::Closed;
        self.connection.close();
        tracing::debug!("Session {} ({}) closed", self.id(), self.identity);
        true
    }
}

/// Business logic receiving every application message.
///
/// One handler is shared by all connections, so implementations must be
/// safe to call concurrently for different sessions. Calls for the same
/// session are always sequential.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one complete application message.
    fn process_message(&self, session: &mut Session, message: &str);

    /// Called exactly once when a session's connection is torn down.
    fn session_closed(&self, _session: &Session) {}
}

impl<F> MessageHandler for F
where
    F: Fn(&mut Session, &str) + Send + Sync + 'static,
{
    fn process_message(&self, session: &mut Session, message: &str) {
        self(session, message);
    }
}
