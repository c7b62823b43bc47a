use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use hybrid_conn::{Connection, HybridConn};
use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

const BUFFER_SIZE: usize = 16 * 1024;

/// Echo everything the client sends until it hangs up.
///
/// The first read runs under `handshake_timeout`, since it is the read that
/// may carry a whole TLS handshake. Later reads are bounded by
/// `idle_timeout` if one is set.
pub async fn serve<C: Connection>(
    mut conn: HybridConn<C>,
    remote_addr: SocketAddr,
    handshake_timeout: Duration,
    idle_timeout: Option<Duration>,
) -> io::Result<()> {
    let mut buf = vec![0; BUFFER_SIZE];

    conn.set_read_deadline(Some(Instant::now() + handshake_timeout))?;
    let mut n = conn.read(&mut buf).await?;

    info!("{}: serving {} connection", remote_addr, if conn.is_upgraded() { "TLS" } else { "plaintext" });

    while n > 0 {
        conn.write_all(&buf[..n]).await?;
        conn.flush().await?;

        conn.set_read_deadline(idle_timeout.map(|idle| Instant::now() + idle))?;
        n = conn.read(&mut buf).await?;
    }

    debug!("{}: client closed the connection", remote_addr);

    conn.close().await
}
