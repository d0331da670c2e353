//! Peek-Conn: wraps a duplex byte stream so that bytes already consumed for
//! routing inspection (the TLS ClientHello, the start of an HTTP request)
//! are transparently replayed to whatever reads the stream next.
//!
//! Only `Read` is overridden. Write, shutdown, and any stream-specific
//! capability (peer address, deadlines) fall straight through to the
//! wrapped stream — callers reach those through [`PeekStream::get_ref`] /
//! [`PeekStream::get_mut`] since this type is generic over the underlying
//! stream and can't re-export methods it doesn't know about.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A duplex stream with a byte prefix that reads back before the live
/// connection does.
pub struct PeekStream<S> {
    prefix: Vec<u8>,
    prefix_pos: usize,
    inner: S,
}

impl<S> PeekStream<S> {
    /// Wraps `inner`, replaying `prefix` first. An empty prefix makes this
    /// behave exactly like the unwrapped stream.
    pub fn new(inner: S, prefix: Vec<u8>) -> Self {
        Self {
            prefix,
            prefix_pos: 0,
            inner,
        }
    }

    /// Re-wraps with an additional prefix `new_prefix`, preserving whatever
    /// of the old prefix had not yet been read. Equivalent to wrapping the
    /// original underlying stream once with `new_prefix ++ remaining_old`.
    pub fn wrap(self, mut new_prefix: Vec<u8>) -> PeekStream<S> {
        if self.prefix_pos < self.prefix.len() {
            new_prefix.extend_from_slice(&self.prefix[self.prefix_pos..]);
        }
        PeekStream {
            prefix: new_prefix,
            prefix_pos: 0,
            inner: self.inner,
        }
    }

    /// Bytes of the prefix not yet delivered to a reader.
    pub fn pending_prefix(&self) -> &[u8] {
        &self.prefix[self.prefix_pos..]
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.prefix_pos < this.prefix.len() {
            let remaining = &this.prefix[this.prefix_pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.prefix_pos += n;
            if this.prefix_pos == this.prefix.len() {
                this.prefix.clear();
                this.prefix_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
