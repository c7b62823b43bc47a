use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, warn};
use parking_lot::RwLock;
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{self, CertifiedKey};
use rustls_pemfile::Item;
use unicase::Ascii;
use webpki::DnsNameRef;

/// Server configurations per listen address, with SNI based key selection.
pub struct TlsManager {
    configs: HashMap<SocketAddr, (Arc<ServerConfig>, Arc<CertResolver>)>,
}

impl TlsManager {
    pub fn new() -> Self {
        Self {
            configs: <_>::default(),
        }
    }

    /// Serve `certified_key` on `listen_addr` for the given SNI names, or as
    /// the default key when `server_names` is empty.
    pub fn add_certified_key(
        &mut self,
        listen_addr: SocketAddr,
        server_names: &[String],
        certified_key: CertifiedKey,
    ) -> Result<()> {
        let (_server_config, cert_resolver) = self.configs.entry(listen_addr)
            .or_insert_with(|| {
                let cert_resolver = Arc::new(CertResolver::new());

                let server_config = ServerConfig::builder()
                    .with_safe_defaults()
                    .with_no_client_auth()
                    .with_cert_resolver(Arc::clone(&cert_resolver) as _);

                (Arc::new(server_config), cert_resolver)
            });

        let certified_key = Arc::new(certified_key);

        if server_names.is_empty() {
            cert_resolver.set_default(certified_key);
            return Ok(());
        }

        for server_name in server_names {
            cert_resolver.add_certified_key(server_name.clone(), Arc::clone(&certified_key))?;
        }

        Ok(())
    }

    pub fn server_config(&self, listen_addr: &SocketAddr) -> Option<Arc<ServerConfig>> {
        let (server_config, _cert_resolver) = self.configs.get(listen_addr)?;

        Some(Arc::clone(server_config))
    }
}

struct CertResolver {
    certified_keys: RwLock<HashMap<Ascii<Cow<'static, str>>, Arc<CertifiedKey>>>,
    default_key: RwLock<Option<Arc<CertifiedKey>>>,
}

impl CertResolver {
    pub fn new() -> Self {
        Self {
            certified_keys: <_>::default(),
            default_key: <_>::default(),
        }
    }

    pub fn add_certified_key(&self,
        server_name: String,
        certified_key: Arc<CertifiedKey>,
    ) -> Result<()> {
        DnsNameRef::try_from_ascii_str(&server_name)
            .map_err(|_| anyhow!("Bad DNS name: {:?}", server_name))?;

        let server_name = Ascii::new(Cow::Owned(server_name));

        self.certified_keys.write().insert(server_name, certified_key);

        Ok(())
    }

    pub fn set_default(&self, certified_key: Arc<CertifiedKey>) {
        *self.default_key.write() = Some(certified_key);
    }

    fn lookup(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let by_name = server_name.and_then(|server_name| {
            let server_name = Ascii::new(Cow::Borrowed(server_name));

            self.certified_keys.read().get(&server_name).map(Arc::clone)
        });

        by_name.or_else(|| self.default_key.read().clone())
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();
        let certified_key = self.lookup(server_name);

        match &certified_key {
            Some(_) => debug!("Resolved certificate for {:?}", server_name),
            None => warn!("No certchain found for {:?}", server_name),
        }

        certified_key
    }
}

/// Load a PEM certificate chain and private key into a signing key.
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey> {
    let certs = load_certs(cert_path)
        .with_context(|| format!("Failed to load certificates from {}", cert_path.display()))?;
    let key = load_private_key(key_path)
        .with_context(|| format!("Failed to load private key from {}", key_path.display()))?;

    let signing_key = sign::any_supported_type(&key)
        .map_err(|_| anyhow!("Unsupported private key type in {}", key_path.display()))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)?;

    if certs.is_empty() {
        bail!("no certificates found");
    }

    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let mut reader = BufReader::new(File::open(path)?);

    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(Item::PKCS8Key(key)) | Some(Item::RSAKey(key)) => return Ok(PrivateKey(key)),
            Some(_) => continue,
            None => bail!("no private key found"),
        }
    }
}
