//! Plain TCP and TLS on one listener.
//!
//! [`HybridConn`] wraps an accepted connection and, if the client opens with
//! a TLS ClientHello, upgrades itself to a TLS server connection in place.
//! Application code reads and writes the same handle either way.

pub mod conn;
pub mod events;
pub mod hybrid;
pub mod proto;
pub mod replay;

pub use conn::{Connection, Deadlines, TcpConn};
pub use events::{ConnEvents, LogEvents, NoEvents};
pub use hybrid::{HybridConn, Sniff, State};
pub use replay::ReplayBuffer;
