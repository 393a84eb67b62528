//! Marker-delimited message framing for text streams.
//!
//! Every application message travels on the wire wrapped in a begin and an
//! end marker:
//!
//! ```text
//! +-------+-----------------+-------+
//! |   #   |     payload     |   $   |
//! +-------+-----------------+-------+
//! ```
//!
//! A single read may carry several wrapped messages back to back, and a
//! single message may be spread over any number of reads. [`FrameAssembler`]
//! buffers fragments until a read ends on the end marker, then yields the
//! complete messages in arrival order.
//!
//! The markers cannot be escaped. A payload that itself contains `$` is cut
//! in two at that point, and a `#` inside a payload is silently dropped.

/// Marker written before every payload.
pub const MESSAGE_BEGIN: &str = "#";

/// Marker written after every payload. A fragment ending with it closes a frame.
pub const MESSAGE_END: &str = "$";

/// Configuration for the framing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameConfig {
    /// Maximum number of bytes held while waiting for an end marker. Default: 1 MB.
    pub max_pending_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_pending_size: 1_048_576,
        }
    }
}

/// Errors that can occur while reassembling frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The pending buffer grew past the configured maximum without seeing an end marker.
    #[error("pending frame size {size} exceeds maximum {max}")]
    PendingOverflow {
        /// Size the buffer would have reached.
        size: usize,
        /// The configured maximum.
        max: usize,
    },
}

/// Wrap a single payload in begin/end markers.
pub fn encode(payload: &str) -> String {
    let mut wire = String::with_capacity(payload.len() + MESSAGE_BEGIN.len() + MESSAGE_END.len());
    wire.push_str(MESSAGE_BEGIN);
    wire.push_str(payload);
    wire.push_str(MESSAGE_END);
    wire
}

/// Wrap every payload and concatenate them, preserving order.
pub fn encode_all<I, S>(payloads: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    payloads.into_iter().fold(String::new(), |mut wire, payload| {
        wire.push_str(MESSAGE_BEGIN);
        wire.push_str(payload.as_ref());
        wire.push_str(MESSAGE_END);
        wire
    })
}

/// Per-connection accumulator turning text fragments into application messages.
///
/// Fragments must be pushed in arrival order. Nothing is shared between
/// assemblers, so each connection owns exactly one.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    pending: Vec<String>,
    pending_len: usize,
    config: FrameConfig,
}

impl FrameAssembler {
    /// Create an empty assembler.
    pub fn new(config: FrameConfig) -> Self {
        Self {
            pending: Vec::new(),
            pending_len: 0,
            config,
        }
    }

    /// Feed one decoded fragment.
    ///
    /// Returns the messages completed by this fragment, which is empty when
    /// the fragment does not end on [`MESSAGE_END`]. On overflow the pending
    /// buffer is discarded so no partial frame survives into later reads.
    pub fn push(&mut self, fragment: &str) -> Result<Messages, FrameError> {
        if fragment.is_empty() {
            return Ok(Messages::empty());
        }

        if !fragment.ends_with(MESSAGE_END) {
            let size = self.pending_len + fragment.len();
            if size > self.config.max_pending_size {
                self.clear();
                return Err(FrameError::PendingOverflow {
                    size,
                    max: self.config.max_pending_size,
                });
            }
            self.pending.push(fragment.to_owned());
            self.pending_len = size;
            return Ok(Messages::empty());
        }

        if self.pending.is_empty() {
            return Ok(Messages::new(fragment));
        }

        let mut raw = String::with_capacity(self.pending_len + fragment.len());
        for part in self.pending.drain(..) {
            raw.push_str(&part);
        }
        raw.push_str(fragment);
        self.pending_len = 0;
        Ok(Messages::new(&raw))
    }

    /// Number of bytes waiting for an end marker.
    pub fn pending_len(&self) -> usize {
        self.pending_len
    }

    /// Whether the assembler sits on a message boundary.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop any buffered fragments.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.pending_len = 0;
    }
}

/// Lazy iterator over the messages contained in one raw frame.
#[derive(Debug)]
pub struct Messages {
    raw: String,
    cursor: usize,
}

impl Messages {
    fn new(raw: &str) -> Self {
        Self {
            raw: raw.replace(MESSAGE_BEGIN, ""),
            cursor: 0,
        }
    }

    fn empty() -> Self {
        Self {
            raw: String::new(),
            cursor: 0,
        }
    }
}

impl Iterator for Messages {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while self.cursor < self.raw.len() {
            let rest = &self.raw[self.cursor..];
            let (piece, advance) = match rest.find(MESSAGE_END) {
                Some(at) => (&rest[..at], at + MESSAGE_END.len()),
                None => (rest, rest.len()),
            };
            self.cursor += advance;
            if !piece.is_empty() {
                return Some(piece.to_owned());
            }
        }
        None
    }
}
