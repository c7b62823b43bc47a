use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_shutdown::Shutdown;
use hybrid_conn::{HybridConn, LogEvents, Sniff, TcpConn};
use log::{debug, error, info, warn};
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::Sender;
use tokio::time::{self, Duration};

const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// How the sockets accepted on one address are wrapped.
#[derive(Clone, Default)]
pub struct Upgrade {
    pub tls_config: Option<Arc<ServerConfig>>,
    pub sniff: Sniff,
}

impl Upgrade {
    fn wrap(&self, stream: TcpStream) -> HybridConn<TcpConn> {
        HybridConn::new(TcpConn::new(stream), self.tls_config.clone())
            .with_sniff(self.sniff)
            .with_events(Arc::new(LogEvents))
    }
}

pub struct Listener {
    listen_addr: SocketAddr,
    shutdown: Shutdown,
}

impl Listener {
    pub async fn start(listen_addr: SocketAddr, upgrade: Upgrade, sender: Sender<Accepted>) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await
            .with_context(|| format!("Failed to listen on {}", listen_addr))?;

        // Port 0 binds resolve to a concrete address here.
        let listen_addr = listener.local_addr()
            .context("Failed to get listener address")?;

        info!(
            "Listening on {} ({})",
            listen_addr,
            if upgrade.tls_config.is_some() { "plaintext or TLS" } else { "plaintext only" },
        );

        let shutdown = Shutdown::new();
        let accept_loop = shutdown.wrap_cancel(accept_loop(listener, listen_addr, upgrade, sender));
        let accept_loop = shutdown.wrap_wait(accept_loop)?;

        tokio::spawn(accept_loop);

        Ok(Self {
            listen_addr,
            shutdown,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub async fn shutdown(&self) {
        self.shutdown.shutdown();
        self.shutdown.wait_shutdown_complete().await;

        info!("Stopped listening on {}", self.listen_addr);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

async fn accept_loop(listener: TcpListener, listen_addr: SocketAddr, upgrade: Upgrade, sender: Sender<Accepted>) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("{}: accept failed: {}", listen_addr, err);
                time::sleep(ACCEPT_BACKOFF).await;
                continue;
            },
        };

        if let Err(err) = stream.set_nodelay(true) {
            warn!("{}: failed to set TCP_NODELAY: {}", remote_addr, err);
        }

        debug!("{}: accepted {}", listen_addr, remote_addr);

        let accepted = Accepted {
            listen_addr,
            remote_addr,
            conn: upgrade.wrap(stream),
        };

        if sender.send(accepted).await.is_err() {
            break;
        }
    }
}

/// A connection ready to serve, not yet read from.
pub struct Accepted {
    pub listen_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub conn: HybridConn<TcpConn>,
}
