//! UDP relay: one mux stream per public source endpoint, datagrams framed
//! as `i32 length (LE) + payload` over the stream, idle sessions evicted.

use crate::base::{ConnGuard, ProxyBase, ProxyError};
use reverb_proto::{consts, BoxedStream, FramedStream, Link};
use reverb_store::Tunnel;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// No datagram in either direction for this long evicts the session.
const SESSION_IDLE: Duration = Duration::from_secs(60);

pub struct UdpTunnelServer {
    base: ProxyBase,
    tunnel: Arc<Tunnel>,
}

impl UdpTunnelServer {
    pub fn new(base: ProxyBase, tunnel: Arc<Tunnel>) -> Self {
        Self { base, tunnel }
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        let socket = Arc::new(UdpSocket::bind(self.tunnel.bind_addr()).await?);
        info!(
            tunnel_id = self.tunnel.id,
            addr = %self.tunnel.bind_addr(),
            "udp tunnel listener started"
        );

        let sessions: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, src) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(tunnel_id = self.tunnel.id, "udp recv error: {}", e);
                    continue;
                }
            };
            let datagram = buf[..n].to_vec();

            let existing = sessions.lock().unwrap().get(&src).cloned();
            if let Some(tx) = existing {
                if tx.send(datagram).await.is_ok() {
                    continue;
                }
                sessions.lock().unwrap().remove(&src);
                continue;
            }

            match self.open_session(src).await {
                Ok((stream, guard)) => {
                    let (tx, rx) = mpsc::channel(64);
                    sessions.lock().unwrap().insert(src, tx.clone());
                    let _ = tx.send(datagram).await;
                    tokio::spawn(run_session(
                        stream,
                        guard,
                        socket.clone(),
                        src,
                        rx,
                        sessions.clone(),
                        self.tunnel.clone(),
                    ));
                }
                Err(e) => {
                    debug!(%src, "udp session open failed: {}", e);
                }
            }
        }
    }

    async fn open_session(
        &self,
        src: SocketAddr,
    ) -> Result<(BoxedStream, ConnGuard), ProxyError> {
        if !self.tunnel.enabled() {
            return Err(ProxyError::NoTarget);
        }
        let agent = self.base.store.get_agent(self.tunnel.agent_id)?;
        let guard = self.base.admit(&agent)?;
        let target = self
            .tunnel
            .targets
            .select()
            .map_err(|_| ProxyError::NoTarget)?;
        let profile = agent.profile();
        let link = Link::new(
            consts::CONN_UDP,
            &target,
            profile.crypt,
            profile.compress,
            &src.to_string(),
            self.tunnel.targets.local_proxy,
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
        Ok((stream, guard))
    }
}

/// Shuttle datagrams both ways until the stream dies or the session idles
/// out; then evict the mapping.
async fn run_session(
    stream: BoxedStream,
    _guard: ConnGuard,
    socket: Arc<UdpSocket>,
    src: SocketAddr,
    mut from_public: mpsc::Receiver<Vec<u8>>,
    sessions: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>,
    tunnel: Arc<Tunnel>,
) {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader: FramedStream<ReadHalf<BoxedStream>> = FramedStream::new(read_half);
    let mut writer: FramedStream<WriteHalf<BoxedStream>> = FramedStream::new(write_half);

    // public client -> agent, bounded by the idle timeout
    let inbound_flow = tunnel.flow.clone();
    let to_agent = tokio::spawn(async move {
        loop {
            match tokio::time::timeout(SESSION_IDLE, from_public.recv()).await {
                Ok(Some(d)) => {
                    if writer.write_len_content(&d).await.is_err() {
                        break;
                    }
                    inbound_flow.add(d.len() as i64, 0);
                }
                // channel closed or session idle
                _ => break,
            }
        }
    });

    // agent -> public client; frame reads must never be cancelled mid-way
    let outbound_flow = tunnel.flow.clone();
    let from_agent = tokio::spawn(async move {
        loop {
            match reader.read_len_content().await {
                Ok(payload) => {
                    if socket.send_to(&payload, src).await.is_err() {
                        break;
                    }
                    outbound_flow.add(0, payload.len() as i64);
                }
                Err(_) => break,
            }
        }
    });

    let to_abort = to_agent.abort_handle();
    let from_abort = from_agent.abort_handle();
    tokio::select! {
        _ = to_agent => from_abort.abort(),
        _ = from_agent => to_abort.abort(),
    }
    sessions.lock().unwrap().remove(&src);
    debug!(%src, "udp session evicted");
}
