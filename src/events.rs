//! Observation hooks for the protocol switch of a hybrid connection.

use std::io;
use std::net::SocketAddr;

/// Receives the notable events of a connection's life.
///
/// Hooks are called with the connection's internal lock held and must not
/// block or call back into the connection.
pub trait ConnEvents: Send + Sync {
    /// A read looked like a ClientHello and a handshake is starting.
    fn client_hello(&self, _peer: Option<SocketAddr>, _len: usize) {}

    /// The handshake completed and the connection now speaks TLS.
    fn upgraded(&self, _peer: Option<SocketAddr>) {}

    /// The handshake failed; the connection is dead.
    fn handshake_failed(&self, _peer: Option<SocketAddr>, _err: &io::Error) {}
}

/// Discards every event.
pub struct NoEvents;

impl ConnEvents for NoEvents {}

/// Forwards events to the `log` facade.
pub struct LogEvents;

impl ConnEvents for LogEvents {
    fn client_hello(&self, peer: Option<SocketAddr>, len: usize) {
        log::debug!("{}: ClientHello sniffed ({} bytes), starting TLS handshake", Peer(peer), len);
    }

    fn upgraded(&self, peer: Option<SocketAddr>) {
        log::info!("{}: upgraded to TLS", Peer(peer));
    }

    fn handshake_failed(&self, peer: Option<SocketAddr>, err: &io::Error) {
        log::warn!("{}: TLS handshake failed: {}", Peer(peer), err);
    }
}

struct Peer(Option<SocketAddr>);

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{}", addr),
            None => f.write_str("<unknown peer>"),
        }
    }
}
