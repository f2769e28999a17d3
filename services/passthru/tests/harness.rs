//! Test harness for passthru integration tests.
//!
//! Provides helpers to spawn TCP echo and TLS backends and a proxy server
//! configured from a protocol group.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

use passthru::{
    supported_protocols, Action, ProtocolGroup, ProtocolManager, Server, ServerOptions,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::{TlsAcceptor, TlsConnector};

#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                tokio::spawn(async move {
                                    let (mut reader, mut writer) = stream.split();
                                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn forward(&self) -> Action {
        Action::forward(self.addr.to_string())
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// TLS server that answers the first read with a fixed marker.
#[allow(dead_code)]
pub struct TlsBackend {
    pub addr: SocketAddr,
    pub cert_der: Vec<u8>,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TlsBackend {
    pub async fn spawn(server_name: &str, marker: &str, alpn: &[&str]) -> io::Result<Self> {
        init_crypto_provider();

        let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()])
            .map_err(io::Error::other)?;

        let cert_der = cert.cert.der().to_vec();
        let key_der = cert.key_pair.serialize_der();

        let certs = vec![CertificateDer::from(cert_der.clone())];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));

        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(io::Error::other)?;
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

        let acceptor = TlsAcceptor::from(Arc::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let connections = Arc::new(AtomicU64::new(0));
        let conn_clone = Arc::clone(&connections);
        let marker_bytes = marker.as_bytes().to_vec();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let acceptor = acceptor.clone();
                                let response = marker_bytes.clone();
                                tokio::spawn(async move {
                                    if let Ok(mut tls_stream) = acceptor.accept(stream).await {
                                        let mut buf = vec![0u8; 1024];
                                        if tls_stream.read(&mut buf).await.is_ok() {
                                            let _ = tls_stream.write_all(&response).await;
                                            let _ = tls_stream.flush().await;
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            cert_der,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn forward(&self) -> Action {
        Action::forward(self.addr.to_string())
    }
}

impl Drop for TlsBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A running proxy server on an ephemeral loopback port.
pub struct ProxyHandle {
    pub server: Arc<Server>,
}

#[allow(dead_code)]
impl ProxyHandle {
    pub async fn spawn(group: ProtocolGroup, options: ServerOptions) -> io::Result<Self> {
        let mut manager = ProtocolManager::new();
        for protocol in supported_protocols() {
            manager.register_protocol(protocol.as_ref());
        }
        manager
            .import_protocol_group(&group)
            .map_err(io::Error::other)?;

        let server = Server::start("127.0.0.1:0", Arc::new(manager), options).await?;
        Ok(Self {
            server: Arc::new(server),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }
}

/// Build a protocol group from `(protocol, rule, action)` triples.
pub fn protocol_group(entries: &[(&str, &str, Action)]) -> ProtocolGroup {
    let mut group = ProtocolGroup::new();
    for (protocol, rule, action) in entries {
        group
            .entry(protocol.to_string())
            .or_default()
            .insert(rule.to_string(), action.clone());
    }
    group
}

/// Poll `check` until it holds or a second passes.
#[allow(dead_code)]
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[allow(dead_code)]
pub async fn tls_client_connect(
    addr: SocketAddr,
    server_name: &str,
    cert_der: &[u8],
    alpn: &[&str],
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    init_crypto_provider();

    let mut root_store = rustls::RootCertStore::empty();
    root_store
        .add(CertificateDer::from(cert_der.to_vec()))
        .map_err(io::Error::other)?;

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

    let connector = TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    connector.connect(server_name, stream).await
}

/// Send `request` over TLS through the proxy and return the backend's reply.
#[allow(dead_code)]
pub async fn tls_roundtrip(
    proxy: SocketAddr,
    server_name: &str,
    cert_der: &[u8],
    alpn: &[&str],
    request: &[u8],
) -> io::Result<String> {
    let mut stream = tls_client_connect(proxy, server_name, cert_der, alpn).await?;
    stream.write_all(request).await?;
    stream.flush().await?;

    let mut buf = vec![0u8; 64];
    let n = stream.read(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf[..n]).to_string())
}
