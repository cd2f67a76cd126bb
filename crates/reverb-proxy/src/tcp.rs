//! TCP-shaped tunnel services: plain `tcp` and `file` forwarding, the
//! transparent `tcpTrans` variant, and the `httpProxy` mode that reads the
//! request head (or CONNECT) to learn its target.

use crate::base::{ProxyBase, ProxyError};
use crate::httputil;
use bytes::Bytes;
use reverb_proto::{consts, BoxedStream};
use reverb_store::{Tunnel, TunnelMode};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Listener service for tcp/file/tcpTrans/httpProxy tunnels.
pub struct TcpTunnelServer {
    base: ProxyBase,
    tunnel: Arc<Tunnel>,
}

impl TcpTunnelServer {
    pub fn new(base: ProxyBase, tunnel: Arc<Tunnel>) -> Self {
        Self { base, tunnel }
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.tunnel.bind_addr()).await?;
        info!(
            tunnel_id = self.tunnel.id,
            mode = self.tunnel.mode.as_str(),
            addr = %self.tunnel.bind_addr(),
            "tunnel listener started"
        );
        loop {
            let (conn, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(tunnel_id = self.tunnel.id, "accept error: {}", e);
                    continue;
                }
            };
            let base = self.base.clone();
            let tunnel = self.tunnel.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_conn(base, tunnel, conn, peer.to_string()).await {
                    debug!(%peer, "tunnel flow ended: {}", e);
                }
            });
        }
    }
}

async fn handle_conn(
    base: ProxyBase,
    tunnel: Arc<Tunnel>,
    conn: tokio::net::TcpStream,
    peer: String,
) -> Result<(), ProxyError> {
    if !tunnel.enabled() {
        return Ok(());
    }
    let agent = base.store.get_agent(tunnel.agent_id)?;
    let _guard = base.admit(&agent)?;

    let local_addr = conn.local_addr().ok();
    let mut public: BoxedStream = Box::new(conn);

    match tunnel.mode {
        TunnelMode::HttpProxy => {
            let Some(head) = httputil::read_request_head(&mut public).await? else {
                return Ok(());
            };
            let is_connect = head.method.eq_ignore_ascii_case("CONNECT");
            let default_port = if is_connect { 443 } else { 80 };
            let target = head.host_with_port(default_port);

            if let Err(e) = base.check_basic_auth(&head, &agent) {
                public.write_all(b"HTTP/1.1 401 Unauthorized\r\n\r\n").await?;
                return Err(e);
            }

            let prior = if is_connect {
                public
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await?;
                None
            } else {
                Some(Bytes::from(head.raw.clone()))
            };
            base.deal_client(public, &agent, &tunnel, &target, prior, consts::CONN_TCP, &peer)
                .await
        }
        TunnelMode::TcpTrans => {
            // transparent mode forwards to the address the client actually
            // dialed
            let target = local_addr
                .map(|a| a.to_string())
                .ok_or(ProxyError::BadRequest)?;
            base.deal_client(public, &agent, &tunnel, &target, None, consts::CONN_TCP, &peer)
                .await
        }
        _ => {
            let target = tunnel.targets.select().map_err(|_| ProxyError::NoTarget)?;
            base.deal_client(public, &agent, &tunnel, &target, None, consts::CONN_TCP, &peer)
                .await
        }
    }
}

/// Secret-mode entry point: the "public" socket arrived over the bridge as
/// a SECRET work channel and was matched to this tunnel by password digest.
pub async fn run_secret_flow(
    base: ProxyBase,
    tunnel: Arc<Tunnel>,
    conn: BoxedStream,
    peer: String,
) -> Result<(), ProxyError> {
    if !tunnel.enabled() {
        return Ok(());
    }
    let agent = base.store.get_agent(tunnel.agent_id)?;
    let _guard = base.admit(&agent)?;
    let target = tunnel.targets.select().map_err(|_| ProxyError::NoTarget)?;
    base.deal_client(conn, &agent, &tunnel, &target, None, consts::CONN_TCP, &peer)
        .await
}
