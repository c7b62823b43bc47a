//! A connection that starts as plain TCP and turns itself into a TLS server
//! connection when the client opens with a ClientHello.
//!
//! Every plaintext read is checked with [`proto::detect`]. On a match the
//! bytes just read are staged back into the [`ReplayBuffer`], a
//! `tokio_rustls` acceptor is started on that same buffer and the handshake
//! is driven from inside the read. Once it completes, the read carries on
//! through the TLS stream, so the caller never sees the ClientHello and
//! gets decrypted application data instead.
//!
//! Reading and writing can happen from different tasks through
//! `&HybridConn`. The stream swap and the `upgraded` flag live behind one
//! lock, which is only held for the duration of a single poll. Writes that
//! arrive while a handshake is in flight wait for the swap and then go to
//! the TLS stream.

use std::future::Future;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::future::poll_fn;
use futures::ready;
use parking_lot::Mutex;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;
use tokio_rustls::server::TlsStream;
use tokio_rustls::{Accept, TlsAcceptor};

use crate::conn::{Connection, Deadlines};
use crate::events::{ConnEvents, LogEvents};
use crate::proto::{self, Proto};
use crate::replay::ReplayBuffer;

/// Which plaintext reads are checked for a ClientHello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff {
    /// Every read, for as long as the connection is plaintext.
    EveryRead,
    /// Only the first read that returns data.
    FirstRead,
}

impl Default for Sniff {
    fn default() -> Self {
        Sniff::EveryRead
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Plaintext,
    Handshaking,
    Established,
    Closed,
}

pub struct HybridConn<C> {
    inner: Mutex<Inner<C>>,
    events: Arc<dyn ConnEvents>,
    sniff: Sniff,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    // Reaches the socket while the TLS acceptor owns it.
    deadlines: Option<Deadlines>,
}

struct Inner<C> {
    stream: Stream<C>,
    tls_config: Option<Arc<ServerConfig>>,
    upgraded: bool,
    plaintext_reads: u64,
    // Deadlines set mid-handshake on a connection without a deadline
    // handle, applied to the TLS stream after the swap.
    deferred_read_deadline: Option<Option<Instant>>,
    deferred_write_deadline: Option<Option<Instant>>,
    reader: Option<Waker>,
    parked: Vec<Waker>,
}

enum Stream<C> {
    Plain(ReplayBuffer<C>),
    Handshaking(Accept<ReplayBuffer<C>>),
    Tls(Box<TlsStream<ReplayBuffer<C>>>),
    Closed,
}

impl<C> Stream<C> {
    fn connection(&self) -> Option<&ReplayBuffer<C>> {
        match self {
            Stream::Plain(replay) => Some(replay),
            Stream::Tls(tls) => Some(tls.get_ref().0),
            Stream::Handshaking(_) | Stream::Closed => None,
        }
    }
}

impl<C: Connection> HybridConn<C> {
    /// Wrap a freshly accepted connection.
    ///
    /// Without a TLS configuration the connection never sniffs and passes
    /// every byte through untouched.
    pub fn new(conn: C, tls_config: Option<Arc<ServerConfig>>) -> Self {
        let local_addr = conn.local_addr().ok();
        let peer_addr = conn.peer_addr().ok();
        let deadlines = conn.deadlines();

        Self {
            inner: Mutex::new(Inner {
                stream: Stream::Plain(ReplayBuffer::new(conn)),
                tls_config,
                upgraded: false,
                plaintext_reads: 0,
                deferred_read_deadline: None,
                deferred_write_deadline: None,
                reader: None,
                parked: Vec::new(),
            }),
            events: Arc::new(LogEvents),
            sniff: Sniff::default(),
            local_addr,
            peer_addr,
            deadlines,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn ConnEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn with_sniff(mut self, sniff: Sniff) -> Self {
        self.sniff = sniff;
        self
    }

    pub fn sniff(&self) -> Sniff {
        self.sniff
    }

    /// Whether a TLS handshake has completed on this connection.
    pub fn is_upgraded(&self) -> bool {
        self.inner.lock().upgraded
    }

    pub fn state(&self) -> State {
        match self.inner.lock().stream {
            Stream::Plain(_) => State::Plaintext,
            Stream::Handshaking(_) => State::Handshaking,
            Stream::Tls(_) => State::Established,
            Stream::Closed => State::Closed,
        }
    }

    pub fn tls_config(&self) -> Option<Arc<ServerConfig>> {
        self.inner.lock().tls_config.clone()
    }

    /// Replace the configuration used for a future handshake.
    ///
    /// Has no effect on a connection that has already been upgraded.
    pub fn set_tls_config(&self, tls_config: Option<Arc<ServerConfig>>) {
        self.inner.lock().tls_config = tls_config;
    }

    /// Shut down and release whatever stream is live.
    ///
    /// A handshake in progress is abandoned. Pending and later operations
    /// fail with `NotConnected`.
    pub async fn close(&self) -> io::Result<()> {
        poll_fn(|cx| self.poll_close(cx)).await
    }

    fn poll_close(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let result = match &mut inner.stream {
            Stream::Plain(replay) => ready!(Pin::new(replay).poll_shutdown(cx)),
            Stream::Tls(tls) => ready!(Pin::new(&mut **tls).poll_shutdown(cx)),
            Stream::Handshaking(_) | Stream::Closed => Ok(()),
        };

        inner.stream = Stream::Closed;
        inner.wake_all();

        Poll::Ready(result)
    }

    fn poll_read_shared(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        loop {
            match &mut inner.stream {
                Stream::Plain(replay) => {
                    let filled = buf.filled().len();

                    match Pin::new(&mut *replay).poll_read(cx, buf) {
                        Poll::Pending => {
                            inner.reader = Some(cx.waker().clone());
                            return Poll::Pending;
                        }
                        Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                        Poll::Ready(Ok(())) => {}
                    }

                    let read = &buf.filled()[filled..];

                    if read.is_empty() {
                        return Poll::Ready(Ok(()));
                    }

                    let candidate = match self.sniff {
                        Sniff::EveryRead => true,
                        Sniff::FirstRead => inner.plaintext_reads == 0,
                    };
                    inner.plaintext_reads += 1;

                    let config = match &inner.tls_config {
                        Some(config) if candidate && proto::detect(read) == Proto::Tls => Arc::clone(config),
                        _ => return Poll::Ready(Ok(())),
                    };

                    self.events.client_hello(self.peer_addr, read.len());

                    // The acceptor has to see the ClientHello again; the caller must not.
                    replay.stage(read);
                    buf.set_filled(filled);

                    inner.start_handshake(config);
                }
                Stream::Handshaking(accept) => match Pin::new(accept).poll(cx) {
                    Poll::Pending => {
                        inner.reader = Some(cx.waker().clone());
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(tls)) => {
                        inner.stream = Stream::Tls(Box::new(tls));
                        inner.upgraded = true;
                        inner.unpark();
                        self.events.upgraded(self.peer_addr);

                        if let Err(err) = inner.apply_deferred_deadlines() {
                            return Poll::Ready(Err(err));
                        }
                    }
                    Poll::Ready(Err(err)) => {
                        inner.stream = Stream::Closed;
                        inner.unpark();
                        self.events.handshake_failed(self.peer_addr, &err);

                        return Poll::Ready(Err(err));
                    }
                },
                Stream::Tls(tls) => {
                    let poll = Pin::new(&mut **tls).poll_read(cx, buf);

                    if poll.is_pending() {
                        inner.reader = Some(cx.waker().clone());
                    }

                    return poll;
                }
                Stream::Closed => return Poll::Ready(Err(not_connected())),
            }
        }
    }

    fn poll_writer<T>(
        &self,
        cx: &mut Context<'_>,
        op: impl FnOnce(Pin<&mut (dyn AsyncWrite + Unpin)>, &mut Context<'_>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        match &mut inner.stream {
            Stream::Plain(replay) => op(Pin::new(replay), cx),
            Stream::Tls(tls) => op(Pin::new(&mut **tls), cx),
            Stream::Handshaking(_) => {
                park(&mut inner.parked, cx.waker());
                Poll::Pending
            }
            Stream::Closed => Poll::Ready(Err(not_connected())),
        }
    }
}

impl<C: Connection> Inner<C> {
    fn start_handshake(&mut self, config: Arc<ServerConfig>) {
        self.stream = match mem::replace(&mut self.stream, Stream::Closed) {
            Stream::Plain(replay) => Stream::Handshaking(TlsAcceptor::from(config).accept(replay)),
            other => other,
        };
    }

    fn apply_deferred_deadlines(&mut self) -> io::Result<()> {
        let conn = match self.stream.connection() {
            Some(conn) => conn,
            None => return Ok(()),
        };

        if let Some(deadline) = self.deferred_read_deadline.take() {
            conn.set_read_deadline(deadline)?;
        }

        if let Some(deadline) = self.deferred_write_deadline.take() {
            conn.set_write_deadline(deadline)?;
        }

        Ok(())
    }

    fn unpark(&mut self) {
        for waker in self.parked.drain(..) {
            waker.wake();
        }
    }

    fn wake_all(&mut self) {
        self.unpark();

        if let Some(waker) = self.reader.take() {
            waker.wake();
        }
    }
}

fn park(parked: &mut Vec<Waker>, waker: &Waker) {
    if !parked.iter().any(|parked| parked.will_wake(waker)) {
        parked.push(waker.clone());
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed")
}

impl<C: Connection> Connection for HybridConn<C> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.inner.lock().stream.connection() {
            Some(conn) => conn.local_addr(),
            None => self.local_addr.ok_or_else(not_connected),
        }
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self.inner.lock().stream.connection() {
            Some(conn) => conn.peer_addr(),
            None => self.peer_addr.ok_or_else(not_connected),
        }
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        match &inner.stream {
            Stream::Handshaking(_) => {
                match &self.deadlines {
                    Some(deadlines) => deadlines.set_read(deadline),
                    None => inner.deferred_read_deadline = Some(deadline),
                }
                Ok(())
            }
            stream => stream
                .connection()
                .ok_or_else(not_connected)?
                .set_read_deadline(deadline),
        }
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        match &inner.stream {
            Stream::Handshaking(_) => {
                match &self.deadlines {
                    Some(deadlines) => deadlines.set_write(deadline),
                    None => inner.deferred_write_deadline = Some(deadline),
                }
                Ok(())
            }
            stream => stream
                .connection()
                .ok_or_else(not_connected)?
                .set_write_deadline(deadline),
        }
    }

    fn deadlines(&self) -> Option<Deadlines> {
        self.deadlines.clone()
    }
}

impl<C: Connection> AsyncRead for HybridConn<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.poll_read_shared(cx, buf)
    }
}

impl<C: Connection> AsyncWrite for HybridConn<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_writer(cx, |stream, cx| stream.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_writer(cx, |stream, cx| stream.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_writer(cx, |stream, cx| stream.poll_shutdown(cx))
    }
}

impl<C: Connection> AsyncRead for &HybridConn<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.poll_read_shared(cx, buf)
    }
}

impl<C: Connection> AsyncWrite for &HybridConn<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_writer(cx, |stream, cx| stream.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_writer(cx, |stream, cx| stream.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_writer(cx, |stream, cx| stream.poll_shutdown(cx))
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use rustls::{Certificate, ClientConfig, ClientConnection, PrivateKey, RootCertStore, ServerName};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    use super::*;
    use crate::events::NoEvents;

    impl Connection for DuplexStream {
        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, 1)))
        }

        fn peer_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, 2)))
        }

        fn set_read_deadline(&self, _deadline: Option<Instant>) -> io::Result<()> {
            Ok(())
        }

        fn set_write_deadline(&self, _deadline: Option<Instant>) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: parking_lot::Mutex<Vec<&'static str>>,
    }

    impl ConnEvents for Recorder {
        fn client_hello(&self, _peer: Option<SocketAddr>, _len: usize) {
            self.events.lock().push("client_hello");
        }

        fn upgraded(&self, _peer: Option<SocketAddr>) {
            self.events.lock().push("upgraded");
        }

        fn handshake_failed(&self, _peer: Option<SocketAddr>, _err: &io::Error) {
            self.events.lock().push("handshake_failed");
        }
    }

    fn server_config() -> (Arc<ServerConfig>, Certificate) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let der = Certificate(cert.serialize_der().unwrap());
        let key = PrivateKey(cert.serialize_private_key_der());

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![der.clone()], key)
            .unwrap();

        (Arc::new(config), der)
    }

    fn client_hello(cert: &Certificate) -> Vec<u8> {
        let mut roots = RootCertStore::empty();
        roots.add(cert).unwrap();

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let name = ServerName::try_from("localhost").unwrap();
        let mut client = ClientConnection::new(Arc::new(config), name).unwrap();

        let mut hello = Vec::new();
        client.write_tls(&mut hello).unwrap();
        hello
    }

    // Consistent headers around an empty ClientHello body.
    const FAKE_HELLO: [u8; 9] = [0x16, 0x03, 0x01, 0x00, 0x04, 0x01, 0x00, 0x00, 0x00];

    #[tokio::test]
    async fn plaintext_passes_through() {
        let (near, mut far) = duplex(1024);
        let (config, _) = server_config();
        let mut conn = HybridConn::new(near, Some(config));
        far.write_all(&[0x01, 0x01]).await.unwrap();

        let mut buf = [0; 1024];
        let n = conn.read(&mut buf).await.unwrap();

        assert_eq!(&buf[..n], &[0x01, 0x01]);
        assert!(!conn.is_upgraded());
        assert_eq!(conn.state(), State::Plaintext);
    }

    #[tokio::test]
    async fn without_tls_config_a_client_hello_is_plain_data() {
        let (near, mut far) = duplex(1024);
        let mut conn = HybridConn::new(near, None);
        far.write_all(&FAKE_HELLO).await.unwrap();

        let mut buf = [0; 1024];
        let n = conn.read(&mut buf).await.unwrap();

        assert_eq!(&buf[..n], &FAKE_HELLO);
        assert_eq!(conn.state(), State::Plaintext);
    }

    #[tokio::test]
    async fn length_mismatch_is_plain_data() {
        let (near, mut far) = duplex(1024);
        let (config, _) = server_config();
        let recorder = Arc::new(Recorder::default());
        let mut conn = HybridConn::new(near, Some(config)).with_events(recorder.clone());

        let mut almost = FAKE_HELLO.to_vec();
        almost[4] = 0x05;
        far.write_all(&almost).await.unwrap();

        let mut buf = [0; 1024];
        let n = conn.read(&mut buf).await.unwrap();

        assert_eq!(&buf[..n], &almost[..]);
        assert!(!conn.is_upgraded());
        assert!(recorder.events.lock().is_empty());
    }

    fn near_misses() -> Vec<Vec<u8>> {
        let mut cases = Vec::new();

        // Every field the signature checks, bent to other values. The
        // version bytes (1, 2) are not part of it.
        for index in [0, 3, 4, 5, 6, 7, 8] {
            for value in [0x00, 0x01, 0x02, 0x03, 0x15, 0x16, 0x17, 0x80, 0xff] {
                if FAKE_HELLO[index] != value {
                    let mut case = FAKE_HELLO.to_vec();
                    case[index] = value;
                    cases.push(case);
                }
            }
        }

        for len in 1..FAKE_HELLO.len() {
            cases.push(FAKE_HELLO[..len].to_vec());
        }

        let mut trailing = FAKE_HELLO.to_vec();
        trailing.push(0x00);
        cases.push(trailing);

        cases
    }

    #[tokio::test]
    async fn near_miss_headers_are_plain_data() {
        let (near, mut far) = duplex(1024);
        let (config, _) = server_config();
        let recorder = Arc::new(Recorder::default());
        let mut conn = HybridConn::new(near, Some(config)).with_events(recorder.clone());

        let mut buf = [0; 1024];
        for case in near_misses() {
            far.write_all(&case).await.unwrap();

            let n = conn.read(&mut buf).await.unwrap();

            assert_eq!(&buf[..n], &case[..], "{:02x?} was not passed through", case);
            assert_eq!(conn.state(), State::Plaintext, "{:02x?} started a handshake", case);
        }

        assert!(recorder.events.lock().is_empty());
        assert!(!conn.is_upgraded());
    }

    #[tokio::test]
    async fn first_read_policy_ignores_later_hellos() {
        let (near, mut far) = duplex(1024);
        let (config, _) = server_config();
        let mut conn = HybridConn::new(near, Some(config)).with_sniff(Sniff::FirstRead);

        let mut buf = [0; 1024];
        far.write_all(b"hello").await.unwrap();
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        far.write_all(&FAKE_HELLO).await.unwrap();
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &FAKE_HELLO);
        assert_eq!(conn.state(), State::Plaintext);
    }

    #[tokio::test]
    async fn broken_handshake_fails_the_read() {
        let (near, mut far) = duplex(1024);
        let (config, _) = server_config();
        let recorder = Arc::new(Recorder::default());
        let mut conn = HybridConn::new(near, Some(config)).with_events(recorder.clone());
        far.write_all(&FAKE_HELLO).await.unwrap();

        let mut buf = [0; 1024];
        assert!(conn.read(&mut buf).await.is_err());

        assert!(!conn.is_upgraded());
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(*recorder.events.lock(), vec!["client_hello", "handshake_failed"]);

        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn writes_wait_for_the_handshake_and_close_releases_them() {
        let (near, mut far) = duplex(64 * 1024);
        let (config, cert) = server_config();
        let conn = HybridConn::new(near, Some(config));
        far.write_all(&client_hello(&cert)).await.unwrap();

        // The server flight goes out, then the handshake waits for the client.
        let mut buf = [0; 4096];
        let mut reader = &conn;
        assert!(timeout(Duration::from_millis(100), reader.read(&mut buf)).await.is_err());
        assert_eq!(conn.state(), State::Handshaking);

        let mut writer = &conn;
        assert!(timeout(Duration::from_millis(100), writer.write(b"early")).await.is_err());

        let (written, closed) = tokio::join!(writer.write(b"early"), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            conn.close().await
        });

        closed.unwrap();
        assert_eq!(written.unwrap_err().kind(), io::ErrorKind::NotConnected);
        assert_eq!(conn.state(), State::Closed);
        assert!(!conn.is_upgraded());
    }

    #[tokio::test]
    async fn tls_config_accessors() {
        let (near, _far) = duplex(64);
        let (config, _) = server_config();
        let conn = HybridConn::new(near, None).with_events(Arc::new(NoEvents));
        assert!(conn.tls_config().is_none());

        conn.set_tls_config(Some(config.clone()));
        assert!(Arc::ptr_eq(&conn.tls_config().unwrap(), &config));
        assert_eq!(conn.sniff(), Sniff::EveryRead);
    }

    #[tokio::test]
    async fn addresses_survive_close() {
        let (near, _far) = duplex(64);
        let conn = HybridConn::new(near, None);
        conn.close().await.unwrap();

        assert_eq!(conn.peer_addr().unwrap(), SocketAddr::from((Ipv4Addr::LOCALHOST, 2)));
        assert!(conn.set_read_deadline(None).is_err());
    }
}
