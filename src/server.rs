//! Proxy supervisor: owns the running-task table, dispatches tunnel modes
//! to their services and consumes bridge events.

use crate::config::ServerConfig;
use anyhow::Context;
use reverb_bridge::{Bridge, BridgeEvent};
use reverb_proxy::base::ProxyBase;
use reverb_proxy::cache::HttpCache;
use reverb_proxy::http::HttpVhostServer;
use reverb_proxy::https::HttpsServer;
use reverb_proxy::socks5::Socks5Server;
use reverb_proxy::tcp::{run_secret_flow, TcpTunnelServer};
use reverb_proxy::udp::UdpTunnelServer;
use reverb_proxy::SubListener;
use reverb_store::{Store, Tunnel, TunnelMode};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A listener that is either a plain TCP socket or one protocol class of
/// the shared-port multiplexer.
pub enum Ingress {
    Tcp(TcpListener),
    Mux(SubListener),
}

impl Ingress {
    pub async fn next(&mut self) -> Option<(reverb_proto::BoxedStream, SocketAddr)> {
        match self {
            Ingress::Tcp(listener) => loop {
                match listener.accept().await {
                    Ok((conn, peer)) => {
                        if let Err(e) = set_keepalive(&conn) {
                            warn!(%peer, "keepalive setup failed: {}", e);
                        }
                        return Some((Box::new(conn), peer));
                    }
                    Err(e) => {
                        warn!("accept error: {}", e);
                        continue;
                    }
                }
            },
            Ingress::Mux(sub) => sub.accept().await,
        }
    }
}

pub struct Supervisor {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub bridge: Arc<Bridge>,
    pub base: ProxyBase,
    pub vhost: Arc<HttpVhostServer>,
    pub https: Arc<HttpsServer>,
    /// Running ingress tasks by tunnel id; listenerless modes hold `None`.
    run_list: Mutex<HashMap<i32, Option<JoinHandle<()>>>>,
}

impl Supervisor {
    pub fn new(
        config: ServerConfig,
        store: Arc<Store>,
        bridge: Arc<Bridge>,
        base: ProxyBase,
    ) -> Arc<Self> {
        let cache = if config.http_cache {
            Some(Arc::new(HttpCache::new(config.http_cache_length)))
        } else {
            None
        };
        let vhost = Arc::new(HttpVhostServer::new(
            base.clone(),
            config.http_add_origin_header,
            cache,
        ));
        let default_cert = config
            .https_default_cert_file
            .clone()
            .zip(config.https_default_key_file.clone());
        let https = Arc::new(HttpsServer::new(
            base.clone(),
            vhost.clone(),
            config.https_just_proxy,
            default_cert,
        ));
        Arc::new(Self {
            config,
            store,
            bridge,
            base,
            vhost,
            https,
            run_list: Mutex::new(HashMap::new()),
        })
    }

    /// Start every enabled tunnel already in the store.
    pub async fn start_existing(&self) {
        let (tunnels, _) = self.store.list_tunnels(&Default::default());
        for tunnel in tunnels {
            if tunnel.enabled() {
                self.add_task(tunnel).await;
            }
        }
    }

    /// Register (and for listener modes, spawn) one tunnel service.
    pub async fn add_task(&self, tunnel: Arc<Tunnel>) {
        if tunnel.mode.is_listenerless() {
            self.run_list.lock().unwrap().insert(tunnel.id, None);
            info!(tunnel_id = tunnel.id, mode = tunnel.mode.as_str(), "tunnel registered");
            return;
        }
        let handle = self.spawn_service(tunnel.clone());
        if let Some(Some(old)) = self
            .run_list
            .lock()
            .unwrap()
            .insert(tunnel.id, Some(handle))
        {
            old.abort();
        }
        info!(
            tunnel_id = tunnel.id,
            mode = tunnel.mode.as_str(),
            port = tunnel.port,
            "tunnel started"
        );
    }

    fn spawn_service(&self, tunnel: Arc<Tunnel>) -> JoinHandle<()> {
        let base = self.base.clone();
        let public_ip = self.config.public_ip;
        tokio::spawn(async move {
            let id = tunnel.id;
            let result = match tunnel.mode {
                TunnelMode::Udp => UdpTunnelServer::new(base, tunnel).run().await,
                TunnelMode::Socks5 => Socks5Server::new(base, tunnel, public_ip).run().await,
                _ => TcpTunnelServer::new(base, tunnel).run().await,
            };
            if let Err(e) = result {
                warn!(tunnel_id = id, "tunnel service exited: {}", e);
            }
        })
    }

    pub fn stop_task(&self, id: i32) -> bool {
        match self.run_list.lock().unwrap().remove(&id) {
            Some(handle) => {
                if let Some(handle) = handle {
                    handle.abort();
                }
                info!(tunnel_id = id, "tunnel stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, id: i32) -> bool {
        self.run_list.lock().unwrap().contains_key(&id)
    }

    /// Consume bridge events until the channel closes.
    pub async fn run_events(self: Arc<Self>, mut events: mpsc::Receiver<BridgeEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                BridgeEvent::OpenTunnel(tunnel) => {
                    self.add_task(tunnel).await;
                }
                BridgeEvent::CloseTunnel(id) => {
                    self.stop_task(id);
                }
                BridgeEvent::AgentClosed(agent_id) => {
                    self.on_agent_closed(agent_id);
                }
                BridgeEvent::Secret {
                    password_digest,
                    conn,
                    peer,
                } => {
                    self.on_secret(password_digest, conn, peer);
                }
            }
        }
    }

    /// Stop ingress for a departed agent; records it registered over the
    /// config channel go with it.
    fn on_agent_closed(&self, agent_id: i32) {
        info!(agent_id, "stopping ingress for closed agent");
        for tunnel in self.store.tunnels_for_agent(agent_id) {
            self.stop_task(tunnel.id);
            if tunnel.no_store {
                let _ = self.store.delete_tunnel(tunnel.id);
            }
        }
        for host in self.store.hosts_for_agent(agent_id) {
            if host.no_store {
                let _ = self.store.delete_host(host.id);
            }
        }
    }

    fn on_secret(&self, password_digest: String, conn: reverb_proto::BoxedStream, peer: SocketAddr) {
        let Some(tunnel) = self.store.get_tunnel_by_md5_password(&password_digest) else {
            debug!("secret connection with unknown password");
            return;
        };
        if !tunnel.enabled() || !self.is_running(tunnel.id) {
            debug!(tunnel_id = tunnel.id, "secret tunnel is not running");
            return;
        }
        let base = self.base.clone();
        tokio::spawn(async move {
            if let Err(e) = run_secret_flow(base, tunnel, conn, peer.to_string()).await {
                debug!(%peer, "secret flow ended: {}", e);
            }
        });
    }

    /// Per-minute sweep keeping an operational trace of the fabric.
    pub fn spawn_flow_tick(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let (agents, _) = this.store.list_agents(&Default::default());
                let total_in: i64 = agents.iter().map(|a| a.flow.inlet()).sum();
                let total_out: i64 = agents.iter().map(|a| a.flow.export()).sum();
                debug!(
                    agents_online = this.bridge.online_count(),
                    total_in, total_out, "flow sweep"
                );
            }
        })
    }
}

#[async_trait::async_trait]
impl reverb_admin::TaskControl for Supervisor {
    async fn start_tunnel(&self, id: i32) -> Result<(), String> {
        let tunnel = self.store.get_tunnel(id).map_err(|e| e.to_string())?;
        tunnel.set_enabled(true);
        self.add_task(tunnel).await;
        Ok(())
    }

    async fn stop_tunnel(&self, id: i32) -> Result<(), String> {
        if self.stop_task(id) {
            if let Ok(tunnel) = self.store.get_tunnel(id) {
                tunnel.set_enabled(false);
            }
            Ok(())
        } else {
            Err("task is not running".to_string())
        }
    }
}

/// Enable the 5-second TCP keep-alive agents rely on for their signal
/// connections.
pub fn set_keepalive(stream: &tokio::net::TcpStream) -> anyhow::Result<()> {
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(std::time::Duration::from_secs(5))
        .with_interval(std::time::Duration::from_secs(5));
    sock.set_tcp_keepalive(&keepalive)
        .context("set tcp keepalive")
}
