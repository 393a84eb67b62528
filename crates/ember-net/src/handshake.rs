//! Client side of the WebSocket upgrade handshake (RFC 6455 §4).
//!
//! [`ClientHandshake`] is a pure state machine: it produces the upgrade
//! request bytes and consumes whatever the socket delivers until a complete
//! response head is seen. It never touches the socket itself.
//!
//! ```text
//! NotStarted --start()--> AwaitingUpgradeResponse --valid 101--> Complete
//!                                 |
//!                                 +--invalid / oversized-------> Failed
//! ```

use std::fmt;
use std::net::SocketAddr;

use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
const HTTP_PREFIX: &[u8] = b"HTTP/";

/// Progress of the upgrade handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// No request sent yet.
    NotStarted,
    /// Request sent, collecting the response.
    AwaitingUpgradeResponse,
    /// Upgrade accepted. Frames may flow.
    Complete,
    /// Upgrade rejected. The connection must be closed.
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors produced while driving the handshake.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// An operation was attempted in a state that does not allow it.
    #[error("handshake operation not allowed in state {0}")]
    InvalidState(HandshakeState),
    /// The response head grew past the configured limit.
    #[error("handshake response exceeds {max} bytes")]
    ResponseTooLarge {
        /// The configured limit.
        max: usize,
    },
    /// The response head could not be parsed.
    #[error("malformed handshake response: {0}")]
    Malformed(String),
    /// The server answered with something other than 101.
    #[error("unexpected handshake status {0}")]
    BadStatus(u16),
    /// `Upgrade: websocket` or `Connection: upgrade` is missing.
    #[error("handshake response does not upgrade to websocket")]
    MissingUpgrade,
    /// `Sec-WebSocket-Accept` does not match the key that was sent.
    #[error("Sec-WebSocket-Accept does not match the request key")]
    AcceptMismatch,
}

/// What a call to [`ClientHandshake::feed`] achieved.
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// The response head is incomplete.
    NeedMore,
    /// The unit was not part of an HTTP response and was dropped.
    Discarded,
    /// The upgrade succeeded. `leftover` holds bytes received after the head.
    Complete {
        /// Bytes that already belong to the WebSocket stream.
        leftover: Vec<u8>,
    },
}

/// Upgrade URI for a peer: `ws://<ip>:<port><path>`.
pub fn upgrade_uri(remote: SocketAddr, path: &str) -> String {
    format!("ws://{remote}{path}")
}

/// Client handshake state machine.
#[derive(Debug)]
pub struct ClientHandshake {
    state: HandshakeState,
    key: String,
    buffer: Vec<u8>,
    max_response_size: usize,
}

impl ClientHandshake {
    /// Create a handshake with a fresh random key.
    pub fn new(max_response_size: usize) -> Self {
        Self::with_key(generate_key(), max_response_size)
    }

    /// Create a handshake with a caller-supplied key.
    pub fn with_key(key: impl Into<String>, max_response_size: usize) -> Self {
        Self {
            state: HandshakeState::NotStarted,
            key: key.into(),
            buffer: Vec::new(),
            max_response_size,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The `Sec-WebSocket-Key` sent with the request.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Build the upgrade request for `remote` and move to
    /// [`HandshakeState::AwaitingUpgradeResponse`].
    pub fn start(&mut self, remote: SocketAddr, path: &str) -> Result<Vec<u8>, HandshakeError> {
        if self.state != HandshakeState::NotStarted {
            return Err(HandshakeError::InvalidState(self.state));
        }

        tracing::debug!("Requesting upgrade to {}", upgrade_uri(remote, path));
        let request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {remote}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             \r\n",
            key = self.key
        );
        self.state = HandshakeState::AwaitingUpgradeResponse;
        Ok(request.into_bytes())
    }

    /// Consume one inbound unit.
    ///
    /// Units that cannot begin an HTTP response are dropped with a warning and
    /// leave the state unchanged. A response split across several units is
    /// buffered until its head is complete.
    pub fn feed(&mut self, unit: &[u8]) -> Result<HandshakeProgress, HandshakeError> {
        if self.state != HandshakeState::AwaitingUpgradeResponse {
            return Err(HandshakeError::InvalidState(self.state));
        }
        if unit.is_empty() {
            return Ok(HandshakeProgress::NeedMore);
        }

        if self.buffer.is_empty() && !starts_like_http(unit) {
            tracing::warn!(
                "Received {} bytes before handshake complete, discarding",
                unit.len()
            );
            return Ok(HandshakeProgress::Discarded);
        }

        self.buffer.extend_from_slice(unit);

        let Some(at) = find(&self.buffer, HEAD_TERMINATOR) else {
            if self.buffer.len() > self.max_response_size {
                return Err(self.fail(HandshakeError::ResponseTooLarge {
                    max: self.max_response_size,
                }));
            }
            return Ok(HandshakeProgress::NeedMore);
        };

        let head_len = at + HEAD_TERMINATOR.len();
        if head_len > self.max_response_size {
            return Err(self.fail(HandshakeError::ResponseTooLarge {
                max: self.max_response_size,
            }));
        }

        let leftover = self.buffer.split_off(head_len);
        let head = std::mem::take(&mut self.buffer);
        match self.validate(&head) {
            Ok(()) => {
                tracing::debug!("Handshake complete");
                self.state = HandshakeState::Complete;
                Ok(HandshakeProgress::Complete { leftover })
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, error: HandshakeError) -> HandshakeError {
        tracing::warn!("Handshake failed: {error}");
        self.state = HandshakeState::Failed;
        self.buffer.clear();
        error
    }

    fn validate(&self, head: &[u8]) -> Result<(), HandshakeError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| HandshakeError::Malformed("response head is not UTF-8".into()))?;
        let mut lines = text.split("\r\n");

        let status_line = lines.next().unwrap_or_default();
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| HandshakeError::Malformed(format!("bad status line {status_line:?}")))?;
        if status != 101 {
            return Err(HandshakeError::BadStatus(status));
        }

        let mut upgrade = false;
        let mut connection = false;
        let mut accept = None;
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HandshakeError::Malformed(format!("bad header {line:?}")))?;
            let value = value.trim();
            if name.eq_ignore_ascii_case("upgrade") {
                upgrade = value.eq_ignore_ascii_case("websocket");
            } else if name.eq_ignore_ascii_case("connection") {
                connection = value.to_ascii_lowercase().contains("upgrade");
            } else if name.eq_ignore_ascii_case("sec-websocket-accept") {
                accept = Some(value);
            }
        }

        if !upgrade || !connection {
            return Err(HandshakeError::MissingUpgrade);
        }
        if accept != Some(derive_accept_key(self.key.as_bytes()).as_str()) {
            return Err(HandshakeError::AcceptMismatch);
        }
        Ok(())
    }
}

fn starts_like_http(unit: &[u8]) -> bool {
    let n = unit.len().min(HTTP_PREFIX.len());
    unit[..n] == HTTP_PREFIX[..n]
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
