use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use hybrid_conn::Sniff;
use serde::Deserialize;

const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Server {
    pub name: String,
    pub listen: SocketAddr,
    #[serde(default)]
    pub sniff: SniffPolicy,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    pub idle_timeout_ms: Option<u64>,
    pub tls: Option<Tls>,
}

impl Server {
    /// Deadline for the first read, which covers a TLS handshake.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SniffPolicy {
    EveryRead,
    FirstRead,
}

impl Default for SniffPolicy {
    fn default() -> Self {
        SniffPolicy::EveryRead
    }
}

impl From<SniffPolicy> for Sniff {
    fn from(policy: SniffPolicy) -> Self {
        match policy {
            SniffPolicy::EveryRead => Sniff::EveryRead,
            SniffPolicy::FirstRead => Sniff::FirstRead,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Tls {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// SNI names served with this key. Empty makes it the listener's default.
    #[serde(default)]
    pub server_names: Vec<String>,
}
