use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{NoServerSessionStorage, ServerSessionMemoryCache, StoresServerSessions};

use crate::error::{EngineError, EngineResult};

/// Client-certificate verification policy.
#[derive(Clone, Debug)]
pub enum VerifyMode {
    Off,
    /// Require and verify a client certificate against the configured
    /// CA bundle. Chain-depth limiting is handled by the TLS stack.
    Required { depth: u32 },
}

/// Session resumption storage: disabled, the built-in in-memory cache,
/// or a caller-supplied store (covering pluggable get/add/delete).
#[derive(Clone)]
pub enum TlsSessionCache {
    Off,
    Builtin(usize),
    Custom(Arc<dyn StoresServerSessions>),
}

impl fmt::Debug for TlsSessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsSessionCache::Off => f.write_str("Off"),
            TlsSessionCache::Builtin(cap) => write!(f, "Builtin({cap})"),
            TlsSessionCache::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Listener-init TLS material and policy.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: Option<PathBuf>,
    /// Advisory cipher preference string. The negotiated suites follow
    /// the TLS provider's defaults; the list is validated and logged.
    pub cipher_list: Option<String>,
    pub verify: VerifyMode,
    pub session_cache: TlsSessionCache,
    /// When false, SNI is ignored for virtual-host selection.
    pub enable_sni: bool,
}

impl TlsConfig {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ca_path: None,
            cipher_list: None,
            verify: VerifyMode::Off,
            session_cache: TlsSessionCache::Builtin(256),
            enable_sni: true,
        }
    }

    pub(crate) fn build(&self) -> EngineResult<Arc<rustls::ServerConfig>> {
        if let Some(ciphers) = &self.cipher_list {
            if ciphers.trim().is_empty() {
                return Err(EngineError::Config("empty cipher list".to_string()));
            }
            debug!("cipher preference noted: {ciphers}");
        }

        let certs = load_certs(&self.cert_path)?;
        let key = load_key(&self.key_path)?;

        let builder = rustls::ServerConfig::builder();
        let mut config = match &self.verify {
            VerifyMode::Off => builder
                .with_no_client_auth()
                .with_single_cert(certs, key)?,
            VerifyMode::Required { depth } => {
                let ca_path = self.ca_path.as_ref().ok_or_else(|| {
                    EngineError::Config(
                        "client verification requires a CA bundle path".to_string(),
                    )
                })?;
                debug!("client cert verification on, advisory depth {depth}");
                let mut roots = rustls::RootCertStore::empty();
                for cert in load_certs(ca_path)? {
                    roots
                        .add(cert)
                        .map_err(|err| EngineError::Config(format!("bad CA cert: {err}")))?;
                }
                let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|err| EngineError::Config(format!("client verifier: {err}")))?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)?
            }
        };

        config.session_storage = match &self.session_cache {
            TlsSessionCache::Off => Arc::new(NoServerSessionStorage {}),
            TlsSessionCache::Builtin(capacity) => ServerSessionMemoryCache::new(*capacity),
            TlsSessionCache::Custom(store) => store.clone(),
        };

        info!("tls listener config loaded from {}", self.cert_path.display());
        Ok(Arc::new(config))
    }
}

fn load_certs(path: &Path) -> EngineResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|err| EngineError::Config(format!("{}: {err}", path.display())))?;
    let mut reader = BufReader::new(file);
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|err| EngineError::Config(format!("bad certificate: {err}")))?;
    if certs.is_empty() {
        return Err(EngineError::Config(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> EngineResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|err| EngineError::Config(format!("{}: {err}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| EngineError::Config(format!("bad private key: {err}")))?
        .ok_or_else(|| EngineError::Config(format!("no private key in {}", path.display())))
}

/// A TLS session over a non-blocking socket. Plaintext reads pull TLS
/// records on demand; handshake/output records are flushed by the
/// event loop's write path.
pub(crate) struct TlsStream {
    sock: mio::net::TcpStream,
    session: rustls::ServerConnection,
    sni: Option<String>,
}

impl TlsStream {
    pub(crate) fn new(
        sock: mio::net::TcpStream,
        config: Arc<rustls::ServerConfig>,
    ) -> Result<Self, rustls::Error> {
        Ok(Self {
            sock,
            session: rustls::ServerConnection::new(config)?,
            sni: None,
        })
    }

    pub(crate) fn sni(&self) -> Option<&str> {
        self.sni.as_deref()
    }

    pub(crate) fn wants_write(&self) -> bool {
        self.session.wants_write()
    }

    pub(crate) fn socket_mut(&mut self) -> &mut mio::net::TcpStream {
        &mut self.sock
    }

    fn capture_sni(&mut self) {
        if self.sni.is_none() {
            if let Some(name) = self.session.server_name() {
                self.sni = Some(name.to_string());
            }
        }
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.session.reader().read(buf) {
                Ok(read) => return Ok(read),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    match self.session.read_tls(&mut self.sock) {
                        Ok(0) => return Ok(0),
                        Ok(_) => {
                            self.session.process_new_packets().map_err(|err| {
                                io::Error::new(io::ErrorKind::InvalidData, err)
                            })?;
                            self.capture_sni();
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.session.writer().write(buf)?;
        self.flush()?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.sock) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_file_is_a_config_error() {
        let config = TlsConfig::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(config.build(), Err(EngineError::Config(_))));
    }

    #[test]
    fn file_without_certificates_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::File::create(&cert_path)
            .and_then(|mut f| f.write_all(b"not a pem"))
            .expect("write cert");
        std::fs::File::create(&key_path)
            .and_then(|mut f| f.write_all(b"not a pem"))
            .expect("write key");
        let config = TlsConfig::new(&cert_path, &key_path);
        assert!(matches!(config.build(), Err(EngineError::Config(_))));
    }

    #[test]
    fn empty_cipher_list_is_rejected_before_file_io() {
        let mut config = TlsConfig::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        config.cipher_list = Some("   ".to_string());
        match config.build() {
            Err(EngineError::Config(reason)) => assert!(reason.contains("cipher")),
            other => panic!("expected cipher-list rejection, got {other:?}"),
        }
    }
}
