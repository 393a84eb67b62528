//! Stream wrapper that replays already-read bytes before reading from the inner stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// An I/O object whose first reads return `prefix`.
///
/// Used after the WebSocket handshake, when the read that completed the
/// response head may already contain the first frame.
#[derive(Debug)]
pub struct Rewind<S> {
    prefix: Option<Bytes>,
    inner: S,
}

impl<S> Rewind<S> {
    /// Wrap `inner`, replaying `prefix` first. An empty prefix is a no-op.
    pub fn new(inner: S, prefix: impl Into<Bytes>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            let n = prefix.len().min(buf.remaining());
            buf.put_slice(&prefix.split_to(n));
            if !prefix.is_empty() {
                self.prefix = Some(prefix);
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn test_prefix_read_before_inner() {
        let (mut peer, inner) = duplex(64);
        peer.write_all(b" world").await.unwrap();
        drop(peer);

        let mut stream = Rewind::new(inner, Bytes::from_static(b"hello"));
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_prefix_larger_than_read_buffer() {
        let (peer, inner) = duplex(64);
        drop(peer);

        let mut stream = Rewind::new(inner, b"abcdef".to_vec());
        let mut small = [0u8; 4];
        let n = stream.read(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"abcd");
        let n = stream.read(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"ef");
        assert_eq!(stream.read(&mut small).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_writes_pass_through() {
        let (mut peer, inner) = duplex(64);
        let mut stream = Rewind::new(inner, Vec::<u8>::new());
        stream.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
