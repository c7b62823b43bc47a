//! Replay buffer: bytes already taken off a connection can be put back.
//!
//! Staged bytes are handed out by the following read(s) before the
//! wrapped connection is consulted again. This is what lets a sniffed
//! ClientHello be parsed a second time by the TLS acceptor.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

use crate::conn::{Connection, Deadlines};

pub struct ReplayBuffer<C> {
    inner: C,
    staged: Vec<u8>,
    pos: usize,
}

impl<C> ReplayBuffer<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            staged: Vec::new(),
            pos: 0,
        }
    }

    /// Replace whatever is still staged with a copy of `bytes`.
    pub fn stage(&mut self, bytes: &[u8]) {
        self.staged.clear();
        self.staged.extend_from_slice(bytes);
        self.pos = 0;
    }

    /// Bytes the next read will return before touching the connection.
    pub fn staged(&self) -> &[u8] {
        &self.staged[self.pos..]
    }

    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for ReplayBuffer<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.staged.len() {
            let remaining = &self.staged[self.pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.pos += to_copy;

            if self.pos == self.staged.len() {
                self.staged.clear();
                self.pos = 0;
            }

            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for ReplayBuffer<C> {
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

impl<C: Connection> Connection for ReplayBuffer<C> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.inner.set_read_deadline(deadline)
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.inner.set_write_deadline(deadline)
    }

    fn deadlines(&self) -> Option<Deadlines> {
        self.inner.deadlines()
    }
}
