//! SOCKS5 ingress (RFC 1928) with username/password auth (RFC 1929).
//!
//! CONNECT opens a tunneled TCP stream; UDP-ASSOCIATE binds a relay socket
//! and shuttles SOCKS5 UDP datagrams over a `udp5` mux stream, repurposing
//! the 2-byte RSV field as the data-segment length so the datagram boundary
//! survives the byte stream. BIND is refused. A tunnel's multi-account map
//! takes precedence over the agent's credentials.

use crate::base::{ConnGuard, ProxyBase, ProxyError};
use reverb_proto::{consts, BoxedStream, Link};
use reverb_store::Tunnel;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info, warn};

pub mod datagram;

const SOCKS_VERSION: u8 = 5;

const METHOD_NONE: u8 = 0;
const METHOD_USER_PASS: u8 = 2;
const METHOD_UNACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 1;
const CMD_BIND: u8 = 2;
const CMD_UDP_ASSOCIATE: u8 = 3;

const REP_SUCCEEDED: u8 = 0;
const REP_COMMAND_NOT_SUPPORTED: u8 = 7;
const REP_ADDR_TYPE_NOT_SUPPORTED: u8 = 8;

const AUTH_VERSION: u8 = 1;
const AUTH_SUCCESS: u8 = 0;
const AUTH_FAILURE: u8 = 1;

pub struct Socks5Server {
    base: ProxyBase,
    tunnel: Arc<Tunnel>,
    /// IP advertised to public clients in the UDP-associate reply.
    public_ip: Option<IpAddr>,
}

impl Socks5Server {
    pub fn new(base: ProxyBase, tunnel: Arc<Tunnel>, public_ip: Option<IpAddr>) -> Self {
        Self {
            base,
            tunnel,
            public_ip,
        }
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.tunnel.bind_addr()).await?;
        info!(
            tunnel_id = self.tunnel.id,
            addr = %self.tunnel.bind_addr(),
            "socks5 listener started"
        );
        let this = Arc::new(self);
        loop {
            let (conn, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("socks5 accept error: {}", e);
                    continue;
                }
            };
            let this = this.clone();
            let local = conn.local_addr().ok();
            tokio::spawn(async move {
                if let Err(e) = this.handle_conn(Box::new(conn), peer, local).await {
                    debug!(%peer, "socks5 connection ended: {}", e);
                }
            });
        }
    }

    pub async fn handle_conn(
        &self,
        mut conn: BoxedStream,
        peer: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Result<(), ProxyError> {
        if !self.tunnel.enabled() {
            return Ok(());
        }
        let agent = self.base.store.get_agent(self.tunnel.agent_id)?;
        let guard = self.base.admit(&agent)?;

        // greeting: VER, NMETHODS, METHODS...
        let mut head = [0u8; 2];
        conn.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(ProxyError::BadRequest);
        }
        let mut methods = vec![0u8; head[1] as usize];
        conn.read_exact(&mut methods).await?;

        let profile = agent.profile();
        let needs_auth = self.tunnel.multi_accounts.is_some()
            || (!profile.auth_user.is_empty() && !profile.auth_password.is_empty());

        if needs_auth {
            if !methods.contains(&METHOD_USER_PASS) {
                conn.write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE]).await?;
                return Err(ProxyError::Unauthorized);
            }
            conn.write_all(&[SOCKS_VERSION, METHOD_USER_PASS]).await?;
            self.authenticate(&mut conn, &profile.auth_user, &profile.auth_password)
                .await?;
        } else {
            conn.write_all(&[SOCKS_VERSION, METHOD_NONE]).await?;
        }

        // request: VER, CMD, RSV, ATYP, ADDR, PORT
        let mut req = [0u8; 3];
        conn.read_exact(&mut req).await?;
        match req[1] {
            CMD_CONNECT => self.handle_connect(conn, peer, local, &agent, guard).await,
            CMD_UDP_ASSOCIATE => self.handle_udp_associate(conn, peer, &agent, guard).await,
            CMD_BIND => {
                send_reply(&mut conn, REP_COMMAND_NOT_SUPPORTED, None).await?;
                Ok(())
            }
            _ => {
                send_reply(&mut conn, REP_COMMAND_NOT_SUPPORTED, None).await?;
                Ok(())
            }
        }
    }

    /// RFC 1929 sub-negotiation. The multi-account map wins over the agent
    /// credentials when both exist.
    async fn authenticate(
        &self,
        conn: &mut BoxedStream,
        agent_user: &str,
        agent_password: &str,
    ) -> Result<(), ProxyError> {
        let mut head = [0u8; 2];
        conn.read_exact(&mut head).await?;
        if head[0] != AUTH_VERSION {
            return Err(ProxyError::BadRequest);
        }
        let mut user = vec![0u8; head[1] as usize];
        conn.read_exact(&mut user).await?;
        let mut pass_len = [0u8; 1];
        conn.read_exact(&mut pass_len).await?;
        let mut pass = vec![0u8; pass_len[0] as usize];
        conn.read_exact(&mut pass).await?;

        let user = String::from_utf8_lossy(&user).to_string();
        let pass = String::from_utf8_lossy(&pass).to_string();

        let ok = match &self.tunnel.multi_accounts {
            Some(accounts) => accounts.get(&user).map(|p| *p == pass).unwrap_or(false),
            None => user == agent_user && pass == agent_password,
        };

        if ok {
            conn.write_all(&[AUTH_VERSION, AUTH_SUCCESS]).await?;
            Ok(())
        } else {
            conn.write_all(&[AUTH_VERSION, AUTH_FAILURE]).await?;
            Err(ProxyError::Unauthorized)
        }
    }

    async fn handle_connect(
        &self,
        mut conn: BoxedStream,
        peer: SocketAddr,
        local: Option<SocketAddr>,
        agent: &Arc<reverb_store::Agent>,
        _guard: ConnGuard,
    ) -> Result<(), ProxyError> {
        let target = match datagram::read_addr(&mut conn).await {
            Ok(addr) => addr,
            Err(_) => {
                send_reply(&mut conn, REP_ADDR_TYPE_NOT_SUPPORTED, None).await?;
                return Err(ProxyError::BadRequest);
            }
        };

        let profile = agent.profile();
        let link = Link::new(
            consts::CONN_TCP,
            &target.to_string(),
            profile.crypt,
            profile.compress,
            &peer.to_string(),
            self.tunnel.targets.local_proxy,
        );
        let upstream = self
            .base
            .bridge
            .send_link_info(agent.id, link, Some(self.tunnel.mode))
            .await?;
        // success is only reported once the agent-side stream exists
        send_reply(&mut conn, REP_SUCCEEDED, local).await?;

        let upstream = reverb_proto::wrap_stream(
            upstream,
            profile.crypt,
            profile.compress,
            Some(agent.rate()),
            true,
        )
        .await?;
        let (inlet, export) =
            crate::pipe::relay(conn, upstream, Some(self.tunnel.flow.clone())).await;
        agent.flow.add(inlet as i64, export as i64);
        Ok(())
    }

    /// UDP-ASSOCIATE: bind a relay socket, advertise it, and pump SOCKS5
    /// datagrams across a `udp5` stream until the control connection dies.
    async fn handle_udp_associate(
        &self,
        mut conn: BoxedStream,
        peer: SocketAddr,
        agent: &Arc<reverb_store::Agent>,
        _guard: ConnGuard,
    ) -> Result<(), ProxyError> {
        // client's claimed address, read and ignored
        let _ = datagram::read_addr(&mut conn).await;

        let bind_ip = if self.tunnel.server_ip.is_empty() {
            "0.0.0.0".to_string()
        } else {
            self.tunnel.server_ip.clone()
        };
        let relay = match UdpSocket::bind((bind_ip.as_str(), 0)).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                send_reply(&mut conn, REP_ADDR_TYPE_NOT_SUPPORTED, None).await?;
                return Err(e.into());
            }
        };
        let local = relay.local_addr()?;
        let advertised = SocketAddr::new(self.advertised_ip(peer, local), local.port());
        send_reply(&mut conn, REP_SUCCEEDED, Some(advertised)).await?;

        let profile = agent.profile();
        let link = Link::new(
            consts::CONN_UDP5,
            "",
            profile.crypt,
            profile.compress,
            &peer.to_string(),
            false,
        );
        let stream = self
            .base
            .bridge
            .send_link_info(agent.id, link, Some(self.tunnel.mode))
            .await?;
        let stream = reverb_proto::wrap_stream(
            stream,
            profile.crypt,
            profile.compress,
            Some(agent.rate()),
            true,
        )
        .await?;

        let (mut up_r, mut up_w) = tokio::io::split(stream);
        let flow = self.tunnel.flow.clone();
        // the relay learns the client's UDP endpoint from its first datagram
        let client_addr: Arc<std::sync::Mutex<Option<SocketAddr>>> =
            Arc::new(std::sync::Mutex::new(None));

        // public datagrams -> stream, RSV repurposed as data length
        let inbound_relay = relay.clone();
        let inbound_flow = flow.clone();
        let inbound_client = client_addr.clone();
        let to_agent = tokio::spawn(async move {
            let mut buf = vec![0u8; datagram::MAX_DATAGRAM];
            loop {
                let (n, src) = match inbound_relay.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(_) => break,
                };
                inbound_client.lock().unwrap().get_or_insert(src);
                let Ok(mut packet) = datagram::UdpDatagram::parse(&buf[..n]) else {
                    continue;
                };
                packet.set_length_framing();
                if up_w.write_all(&packet.encode()).await.is_err() {
                    break;
                }
                inbound_flow.add(n as i64, 0);
            }
        });

        // stream -> public datagrams, back to the learned client endpoint
        let outbound_relay = relay.clone();
        let outbound_client = client_addr.clone();
        let from_agent = tokio::spawn(async move {
            loop {
                let packet = match datagram::UdpDatagram::read_framed(&mut up_r).await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let Some(dest) = *outbound_client.lock().unwrap() else {
                    continue;
                };
                let wire = packet.encode_plain();
                if outbound_relay.send_to(&wire, dest).await.is_err() {
                    break;
                }
                flow.add(0, wire.len() as i64);
            }
        });

        // the TCP control connection pins the association's lifetime
        let mut scratch = [0u8; 256];
        loop {
            match conn.read(&mut scratch).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        to_agent.abort();
        from_agent.abort();
        debug!(%peer, "udp association closed");
        Ok(())
    }

    /// Pick the relay IP the client can actually reach: loopback clients
    /// get the bound address, public clients get the configured public IP.
    fn advertised_ip(&self, peer: SocketAddr, local: SocketAddr) -> IpAddr {
        if peer.ip().is_loopback() {
            return local.ip();
        }
        self.public_ip.unwrap_or_else(|| local.ip())
    }
}

async fn send_reply(
    conn: &mut BoxedStream,
    rep: u8,
    bound: Option<SocketAddr>,
) -> std::io::Result<()> {
    let mut reply = vec![SOCKS_VERSION, rep, 0, 1];
    match bound {
        Some(SocketAddr::V4(v4)) => {
            reply.extend_from_slice(&v4.ip().octets());
            reply.extend_from_slice(&v4.port().to_be_bytes());
        }
        _ => {
            reply.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    conn.write_all(&reply).await
}
