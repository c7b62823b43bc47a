use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::signal;

use self::config::{Config, Server};
use self::listener::{Accepted, Upgrade};
use self::listener_manager::ListenerManager;
use self::tls_manager::TlsManager;

mod config;
mod echo;
mod listener;
mod listener_manager;
mod tls_manager;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
pub async fn main() -> Result<()> {
    pretty_env_logger::init();

    let config_path = env::args().nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::read(&config_path)
        .with_context(|| format!("failed to read config {}", config_path))?;

    let app = App::new(config).await?;

    loop {
        tokio::select! {
            accepted = app.listener_manager.accept() => app.spawn_connection(accepted?),
            result = signal::ctrl_c() => {
                result.context("failed to listen for ctrl-c")?;
                info!("Shutting down");
                break;
            },
        }
    }

    app.listener_manager.stop_all().await;

    Ok(())
}

struct App {
    listener_manager: ListenerManager,
    servers: HashMap<SocketAddr, Arc<Server>>,
}

impl App {
    async fn new(config: Config) -> Result<Self> {
        let mut tls_manager = TlsManager::new();

        for server in &config.servers {
            if let Some(tls) = &server.tls {
                let certified_key = tls_manager::load_certified_key(&tls.cert, &tls.key)
                    .with_context(|| format!("server {:?}: failed to load TLS key", server.name))?;

                tls_manager.add_certified_key(server.listen, &tls.server_names, certified_key)
                    .with_context(|| format!("server {:?}: failed to add TLS key", server.name))?;
            }
        }

        let listener_manager = ListenerManager::new();
        let mut servers = HashMap::new();

        for server in config.servers {
            let upgrade = Upgrade {
                tls_config: tls_manager.server_config(&server.listen),
                sniff: server.sniff.into(),
            };

            let listen_addr = listener_manager.start_listening_on(server.listen, upgrade).await
                .with_context(|| format!("server {:?}: failed to start", server.name))?;

            info!("{} serves {:?}", listen_addr, server.name);

            servers.insert(listen_addr, Arc::new(server));
        }

        Ok(Self {
            listener_manager,
            servers,
        })
    }

    fn spawn_connection(&self, accepted: Accepted) {
        let Accepted { listen_addr, remote_addr, conn } = accepted;

        let server = match self.servers.get(&listen_addr) {
            Some(server) => Arc::clone(server),
            None => {
                warn!("{}: accepted on unknown listener {}", remote_addr, listen_addr);
                return;
            },
        };

        tokio::spawn(async move {
            let result = echo::serve(conn, remote_addr, server.handshake_timeout(), server.idle_timeout()).await;

            match result {
                Ok(()) => debug!("{}: connection closed", remote_addr),
                Err(err) => warn!("{}: connection failed: {}", remote_addr, err),
            }
        });
    }
}
