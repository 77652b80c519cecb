//! Listener set: turns configured address strings into bound sockets.
//!
//! Binding is the busy check. An exact address that is already taken is
//! logged and skipped, an address carrying the free-port marker walks upwards
//! from the requested port and keeps the first socket it manages to bind, so
//! the port stays reserved. TLS listeners additionally need the certificate
//! and key to load; a failure there skips the TLS listeners only.

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};

/// Suffix asking for a free port search, as in `0.0.0.0:8080+`.
pub const FREE_PORT_MARKER: char = '+';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddress {
    raw: String,
    address: String,
    search_free_port: bool,
}

impl ListenAddress {
    /// `None` for a blank entry.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self {
            raw: trimmed.to_string(),
            address: trimmed.replace(FREE_PORT_MARKER, ""),
            search_free_port: trimmed.contains(FREE_PORT_MARKER),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Address with the marker stripped.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn search_free_port(&self) -> bool {
        self.search_free_port
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Plain,
    Tls,
}

impl Transport {
    pub fn scheme(&self) -> &'static str {
        match self {
            Transport::Plain => "http",
            Transport::Tls => "https",
        }
    }
}

/// A socket ready to accept, with what it was configured from.
pub struct BoundListener {
    pub transport: Transport,
    pub requested: ListenAddress,
    pub local_addr: SocketAddr,
    pub listener: TcpListener,
    pub tls: Option<TlsAcceptor>,
}

/// Binds every configured plain and TLS address. Failures are logged per
/// address and leave the remaining listeners untouched.
pub async fn bind_listeners(config: &ServerConfig) -> Vec<BoundListener> {
    let mut bound = Vec::new();

    if config.enable_plain {
        info!("plain listening is enabled");
        for address in config.listening_addresses.iter().filter_map(|a| ListenAddress::parse(a)) {
            if let Some(listener) = resolve(&address, config.free_port_search_limit).await {
                push_bound(&mut bound, Transport::Plain, address, listener, None);
            }
        }
    }

    if config.enable_tls {
        info!("tls listening is enabled");
        let acceptor = match (&config.tls_cert_path, &config.tls_key_path) {
            (Some(cert), Some(key)) => match load_tls_acceptor(cert, key) {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    error!(error = %e, cert = %cert.display(), key = %key.display(), "failed to load certificates");
                    None
                }
            },
            _ => None,
        };

        for address in config.listening_addresses_tls.iter().filter_map(|a| ListenAddress::parse(a)) {
            let Some(acceptor) = &acceptor else {
                error!(listening_address = address.raw(), "no tls material, skipping listener");
                continue;
            };
            if let Some(listener) = resolve(&address, config.free_port_search_limit).await {
                push_bound(&mut bound, Transport::Tls, address, listener, Some(acceptor.clone()));
            }
        }
    }

    bound
}

fn push_bound(
    bound: &mut Vec<BoundListener>,
    transport: Transport,
    requested: ListenAddress,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
) {
    match listener.local_addr() {
        Ok(local_addr) => bound.push(BoundListener {
            transport,
            requested,
            local_addr,
            listener,
            tls,
        }),
        Err(e) => error!(error = %e, listening_address = requested.raw(), "bound socket has no local address"),
    }
}

async fn resolve(address: &ListenAddress, search_limit: u16) -> Option<TcpListener> {
    if !address.search_free_port() {
        return match TcpListener::bind(address.address()).await {
            Ok(listener) => Some(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                error!(listening_address = address.address(), "listening address already busy");
                None
            }
            Err(e) => {
                error!(error = %e, listening_address = address.address(), "failed to bind listening address");
                None
            }
        };
    }

    match search_and_bind(address.address(), search_limit).await {
        Ok(listener) => {
            if let Ok(local) = listener.local_addr() {
                let requested_port = requested_port(address.address());
                if requested_port.is_some_and(|port| port != 0 && port != local.port()) {
                    warn!(
                        listening_address = address.address(),
                        new_listening_address = %local,
                        "auto binding is enabled, listening address has been changed"
                    );
                }
            }
            Some(listener)
        }
        Err(e) => {
            error!(error = %e, listening_address = address.address(), "no free port found");
            None
        }
    }
}

fn requested_port(address: &str) -> Option<u16> {
    address.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
}

/// Whether binding `address` right now would fail because it is taken.
pub async fn is_tcp_busy(address: &str) -> bool {
    matches!(
        TcpListener::bind(address).await,
        Err(e) if e.kind() == io::ErrorKind::AddrInUse
    )
}

/// Binds the first free port in `[port, port + limit)` on the host of
/// `address`. Port 0 lets the OS choose.
pub async fn search_and_bind(address: &str, limit: u16) -> io::Result<TcpListener> {
    let base = tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("cannot resolve {address}")))?;

    if base.port() == 0 {
        return TcpListener::bind(base).await;
    }

    for offset in 0..limit {
        let Some(port) = base.port().checked_add(offset) else {
            break;
        };
        let candidate = SocketAddr::new(base.ip(), port);
        match TcpListener::bind(candidate).await {
            Ok(listener) => return Ok(listener),
            Err(e) if matches!(e.kind(), io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied) => {
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!("no free port within {limit} ports of {address}"),
    ))
}

/// Loads a PEM certificate chain and private key into a TLS acceptor.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .and_then(|certs| certs.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|e| ServerError::Tls(format!("{}: {e}", cert_path.display())))?;
    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key = PrivateKeyDer::from_pem_file(key_path)
        .map_err(|e| ServerError::Tls(format!("{}: {e}", key_path.display())))?;

    let mut config =
        rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strips_marker() {
        let address = ListenAddress::parse(" 127.0.0.1:8080+ ").unwrap();
        assert_eq!(address.address(), "127.0.0.1:8080");
        assert!(address.search_free_port());

        let exact = ListenAddress::parse("0.0.0.0:80").unwrap();
        assert!(!exact.search_free_port());
        assert!(ListenAddress::parse("   ").is_none());
    }

    #[tokio::test]
    async fn busy_port_is_detected() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = held.local_addr().unwrap().to_string();

        assert!(is_tcp_busy(&addr).await);
        drop(held);
    }

    #[tokio::test]
    async fn search_moves_past_busy_port() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let busy = held.local_addr().unwrap();
        if busy.port() == u16::MAX {
            return;
        }

        let found = search_and_bind(&busy.to_string(), 50).await.unwrap();
        let local = found.local_addr().unwrap();
        assert_ne!(local.port(), busy.port());
        assert!(local.port() > busy.port());
        // the new port stays reserved while the listener lives
        assert!(is_tcp_busy(&local.to_string()).await);
    }

    #[tokio::test]
    async fn exact_busy_address_is_skipped() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let busy = held.local_addr().unwrap().to_string();

        let config = ServerConfig {
            listening_addresses: vec![busy.clone(), "127.0.0.1:0".into(), String::new()],
            ..ServerConfig::default()
        };
        let bound = bind_listeners(&config).await;

        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].transport, Transport::Plain);
        assert_ne!(bound[0].local_addr.to_string(), busy);
    }

    #[tokio::test]
    async fn tls_listeners_skipped_when_material_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            listening_addresses: vec!["127.0.0.1:0".into()],
            enable_tls: true,
            listening_addresses_tls: vec!["127.0.0.1:0".into()],
            tls_cert_path: Some(dir.path().join("missing-cert.pem")),
            tls_key_path: Some(dir.path().join("missing-key.pem")),
            ..ServerConfig::default()
        };

        let bound = bind_listeners(&config).await;
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].transport, Transport::Plain);
    }

    #[test]
    fn load_tls_acceptor_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();

        assert!(matches!(load_tls_acceptor(&cert, &key), Err(ServerError::Tls(_))));
    }

    #[test]
    fn load_tls_acceptor_accepts_generated_pair() {
        let dir = tempfile::tempdir().unwrap();
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, generated.cert.pem()).unwrap();
        std::fs::write(&key, generated.key_pair.serialize_pem()).unwrap();

        assert!(load_tls_acceptor(&cert, &key).is_ok());
    }
}
