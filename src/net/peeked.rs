//! Replay of bytes consumed while sniffing.
//!
//! The sniffer has to read the ClientHello to route on it, but the handler
//! that finally owns the connection must see the stream from byte zero.
//! `PeekedStream` hands out the captured bytes first, then reads through.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Stream that yields `peeked` before reading from `inner`. Writes go straight through.
pub struct PeekedStream<S> {
    peeked: Bytes,
    pos: usize,
    inner: S,
}

impl<S> PeekedStream<S> {
    pub fn new(peeked: Bytes, inner: S) -> Self {
        Self {
            peeked,
            pos: 0,
            inner,
        }
    }

    /// Bytes not yet replayed.
    pub fn remaining(&self) -> usize {
        self.peeked.len().saturating_sub(self.pos)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.peeked.len() {
            let start = self.pos;
            let n = (self.peeked.len() - start).min(buf.remaining());
            buf.put_slice(&self.peeked[start..start + n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
