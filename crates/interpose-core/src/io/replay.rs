//! Replay of bytes that were read past a protocol head.
//!
//! Handshakes such as HTTP CONNECT read the socket in chunks until the end of
//! the request head. Anything received after the head belongs to the tunneled
//! stream (often the first TLS ClientHello) and must be handed back to the
//! next reader before the socket itself is polled again.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream that yields `leftover` before delegating reads to `inner`.
///
/// Writes always go straight to `inner`.
#[derive(Debug)]
pub struct ReplayStream<S> {
    leftover: Bytes,
    inner: S,
}

impl<S> ReplayStream<S> {
    pub fn new(leftover: Bytes, inner: S) -> Self {
        Self { leftover, inner }
    }

    /// Bytes not yet handed to a reader.
    pub fn pending(&self) -> usize {
        self.leftover.remaining()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Split into the unread leftover and the inner stream.
    pub fn into_parts(self) -> (Bytes, S) {
        (self.leftover, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.leftover.has_remaining() {
            let n = self.leftover.remaining().min(buf.remaining());
            buf.put_slice(&self.leftover[..n]);
            self.leftover.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
