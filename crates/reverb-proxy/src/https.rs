//! HTTPS ingress: SNI routing in two modes.
//!
//! Just-proxy hands the raw TLS bytes to the agent like a TCP tunnel, with
//! the sniffed ClientHello replayed first. Terminated mode builds (and
//! caches) a rustls acceptor per SNI from the Host rule's cert/key, falls
//! back to the `default` cert, and runs the decrypted stream through the
//! vhost proxy.

use crate::base::{replay, ProxyBase, ProxyError};
use crate::http::HttpVhostServer;
use crate::sni;
use bytes::{Bytes, BytesMut};
use reverb_proto::{consts, BoxedStream, Link};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

const MAX_HELLO: usize = 16 * 1024;

pub struct HttpsServer {
    base: ProxyBase,
    vhost: Arc<HttpVhostServer>,
    just_proxy: bool,
    /// `default` cert/key paths used when a Host rule has none.
    default_cert: Option<(String, String)>,
    acceptors: Mutex<HashMap<String, TlsAcceptor>>,
    acceptor_builds: AtomicUsize,
}

impl HttpsServer {
    pub fn new(
        base: ProxyBase,
        vhost: Arc<HttpVhostServer>,
        just_proxy: bool,
        default_cert: Option<(String, String)>,
    ) -> Self {
        Self {
            base,
            vhost,
            just_proxy,
            default_cert,
            acceptors: Mutex::new(HashMap::new()),
            acceptor_builds: AtomicUsize::new(0),
        }
    }

    /// How many per-SNI acceptors have been constructed; repeat SNI must
    /// not grow this.
    pub fn acceptor_builds(&self) -> usize {
        self.acceptor_builds.load(Ordering::Relaxed)
    }

    pub async fn handle_connection(&self, conn: BoxedStream, peer: SocketAddr) {
        if let Err(e) = self.process(conn, peer).await {
            debug!(%peer, "https connection ended: {}", e);
        }
    }

    async fn process(&self, mut conn: BoxedStream, peer: SocketAddr) -> Result<(), ProxyError> {
        let (hello, server_name) = read_client_hello(&mut conn).await?;

        if self.just_proxy {
            return self.just_proxy_flow(conn, peer, hello, &server_name).await;
        }

        let acceptor = match self.acceptor_for(&server_name) {
            Some(a) => a,
            None => {
                warn!(sni = %server_name, "no certificate for server name");
                return Ok(());
            }
        };
        let tls = acceptor.accept(replay(hello, conn)).await?;
        self.vhost
            .handle_connection(Box::new(tls), peer, "https")
            .await;
        Ok(())
    }

    /// TLS stays intact end-to-end; route by SNI and forward bytes.
    async fn just_proxy_flow(
        &self,
        conn: BoxedStream,
        peer: SocketAddr,
        hello: Bytes,
        server_name: &str,
    ) -> Result<(), ProxyError> {
        let host = self.base.store.resolve_host(server_name, "https", "/")?;
        let agent = self.base.store.get_agent(host.agent_id)?;
        let _guard = self.base.admit(&agent)?;
        let profile = agent.profile();
        // basic auth cannot travel inside a passthrough TLS stream, so
        // configured credentials block this mode outright
        if !profile.auth_user.is_empty() && !profile.auth_password.is_empty() {
            return Err(ProxyError::Unauthorized);
        }
        let target = host.targets.select().map_err(|_| ProxyError::NoTarget)?;
        let link = Link::new(
            consts::CONN_TCP,
            &target,
            profile.crypt,
            profile.compress,
            &peer.to_string(),
            host.targets.local_proxy,
        );
        self.base
            .join_link(conn, &agent, link, None, host.flow.clone(), Some(hello))
            .await
    }

    fn acceptor_for(&self, server_name: &str) -> Option<TlsAcceptor> {
        if let Some(a) = self.acceptors.lock().unwrap().get(server_name) {
            return Some(a.clone());
        }

        let cert_paths = self
            .base
            .store
            .resolve_host(server_name, "https", "/")
            .ok()
            .and_then(|host| {
                if host.cert_path.is_empty() || host.key_path.is_empty() {
                    None
                } else {
                    Some((host.cert_path.clone(), host.key_path.clone()))
                }
            })
            .or_else(|| self.default_cert.clone())?;

        let acceptor = match build_acceptor(&cert_paths.0, &cert_paths.1) {
            Ok(a) => a,
            Err(e) => {
                warn!(sni = %server_name, "could not load certificate: {}", e);
                return None;
            }
        };
        self.acceptor_builds.fetch_add(1, Ordering::Relaxed);
        self.acceptors
            .lock()
            .unwrap()
            .insert(server_name.to_string(), acceptor.clone());
        Some(acceptor)
    }
}

/// Read TLS records until the SNI can be parsed; returns the sniffed bytes
/// for replay.
async fn read_client_hello(conn: &mut BoxedStream) -> Result<(Bytes, String), ProxyError> {
    let mut buf = BytesMut::with_capacity(4096);
    let mut chunk = vec![0u8; 4096];
    loop {
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::BadRequest);
        }
        buf.extend_from_slice(&chunk[..n]);
        match sni::extract_sni(&buf) {
            Ok(name) => return Ok((buf.freeze(), name)),
            Err(sni::SniError::Truncated) if buf.len() < MAX_HELLO => continue,
            Err(_) => return Err(ProxyError::BadRequest),
        }
    }
}

pub(crate) fn build_acceptor(cert_path: &str, key_path: &str) -> std::io::Result<TlsAcceptor> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key_path)?,
    ))?
    .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "no private key found"))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
