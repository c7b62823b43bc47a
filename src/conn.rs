//! The byte-stream capability shared by raw, replaying and hybrid connections.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{self, Instant, Sleep};

/// A bidirectional byte stream with addresses and absolute deadlines.
///
/// Closing is `AsyncWriteExt::shutdown` followed by dropping the value.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Reads fail with `TimedOut` once `deadline` has passed. `None` clears it.
    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;

    /// Writes fail with `TimedOut` once `deadline` has passed. `None` clears it.
    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;

    fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.set_read_deadline(deadline)?;
        self.set_write_deadline(deadline)
    }

    /// A handle that sets this connection's deadlines without access to the
    /// connection itself, e.g. while a TLS acceptor owns it.
    fn deadlines(&self) -> Option<Deadlines> {
        None
    }
}

/// Shared read and write deadlines of one connection.
#[derive(Clone, Default)]
pub struct Deadlines {
    read: Arc<Mutex<Deadline>>,
    write: Arc<Mutex<Deadline>>,
}

impl Deadlines {
    pub fn set_read(&self, deadline: Option<Instant>) {
        self.read.lock().set(deadline);
    }

    pub fn set_write(&self, deadline: Option<Instant>) {
        self.write.lock().set(deadline);
    }
}

/// An accepted TCP socket with read and write deadlines.
pub struct TcpConn {
    stream: TcpStream,
    deadlines: Deadlines,
}

impl TcpConn {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            deadlines: Deadlines::default(),
        }
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

impl From<TcpStream> for TcpConn {
    fn from(stream: TcpStream) -> Self {
        Self::new(stream)
    }
}

impl Connection for TcpConn {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.deadlines.set_read(deadline);
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.deadlines.set_write(deadline);
        Ok(())
    }

    fn deadlines(&self) -> Option<Deadlines> {
        Some(self.deadlines.clone())
    }
}

impl AsyncRead for TcpConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut deadline = this.deadlines.read.lock();

        if deadline.poll_expired(cx) {
            return Poll::Ready(Err(timed_out("read")));
        }

        deadline.register(Pin::new(&mut this.stream).poll_read(cx, buf), cx)
    }
}

impl AsyncWrite for TcpConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut deadline = this.deadlines.write.lock();

        if deadline.poll_expired(cx) {
            return Poll::Ready(Err(timed_out("write")));
        }

        deadline.register(Pin::new(&mut this.stream).poll_write(cx, buf), cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut deadline = this.deadlines.write.lock();

        if deadline.poll_expired(cx) {
            return Poll::Ready(Err(timed_out("flush")));
        }

        deadline.register(Pin::new(&mut this.stream).poll_flush(cx), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

fn timed_out(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} deadline exceeded", op))
}

#[derive(Default)]
struct Deadline {
    sleep: Option<Pin<Box<Sleep>>>,
    waker: Option<Waker>,
}

impl Deadline {
    fn set(&mut self, deadline: Option<Instant>) {
        self.sleep = deadline.map(|deadline| Box::pin(time::sleep_until(deadline)));

        // A pending operation has to observe the new deadline.
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> bool {
        match &mut self.sleep {
            Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
            None => false,
        }
    }

    fn register<T>(&mut self, poll: Poll<T>, cx: &Context<'_>) -> Poll<T> {
        if poll.is_pending() {
            self.waker = Some(cx.waker().clone());
        }

        poll
    }
}
