use std::path::Path;
use std::fs;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

pub use self::server::Server;

mod server;

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(rename = "server")]
    pub servers: Vec<Server>,
}

impl Config {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let config = fs::read_to_string(path)
            .context("failed to read config")?;

        Self::parse(&config)
    }

    pub fn parse(config: &str) -> Result<Self> {
        let config: Self = toml::from_str(config)
            .context("failed to parse config")?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.servers.is_empty(), "no [[server]] configured");

        for (i, server) in self.servers.iter().enumerate() {
            let duplicate = self.servers[..i].iter()
                .any(|other| other.listen == server.listen);

            ensure!(!duplicate, "server {:?}: {} is already used by another server", server.name, server.listen);
        }

        Ok(())
    }
}
