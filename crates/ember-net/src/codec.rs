//! UTF-8 text codec for the plain-text transport.
//!
//! Decodes raw socket bytes into text units for the framing layer. A read
//! that ends in the middle of a multi-byte character keeps the incomplete
//! tail buffered until the rest arrives, so a character is never split
//! across two units. Invalid sequences are replaced with U+FFFD instead of
//! failing the connection.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Codec turning bytes into `String` units and back.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl TextCodec {
    /// Create a new codec.
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for TextCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let complete = complete_prefix_len(src);

        if complete == 0 {
            return Ok(None);
        }

        let unit = src.split_to(complete);
        Ok(Some(String::from_utf8_lossy(&unit).into_owned()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let unit = src.split();
        Ok(Some(String::from_utf8_lossy(&unit).into_owned()))
    }
}

/// Length of the longest prefix of `bytes` that does not end inside a
/// truncated character. Invalid sequences count as complete.
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let mut start = 0;
    loop {
        match std::str::from_utf8(&bytes[start..]) {
            Ok(_) => return bytes.len(),
            // Truncated character at the end: wait for more bytes.
            Err(e) => match e.error_len() {
                None => return start + e.valid_up_to(),
                Some(invalid) => start += e.valid_up_to() + invalid,
            },
        }
    }
}

impl Encoder<String> for TextCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len());
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}
