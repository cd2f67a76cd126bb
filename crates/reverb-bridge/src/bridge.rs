//! Bridge core: agent handshake, work-channel dispatch and link brokering.

use crate::session::{AgentSession, SignalWriter};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reverb_proto::{
    consts, md5_hex, BoxedStream, FrameError, FramedStream, Link, Mux, MuxError, MuxSide,
};
use reverb_store::{ip_of, Store, StoreError, Tunnel, TunnelMode};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_MAX_MISSES: u32 = 3;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("mux error: {0}")]
    Mux(#[from] MuxError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent core version mismatch")]
    VersionMismatch,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("agent {0} is not connected")]
    AgentNotConnected(i32),

    #[error("the ip {0} is not in the validation list")]
    IpNotRegistered(String),

    #[error("the validation of ip {0} has expired")]
    IpExpired(String),

    #[error("dial to {0} timed out")]
    DialTimeout(String),
}

/// Events the bridge pushes to the proxy supervisor.
pub enum BridgeEvent {
    /// A tunnel registered over the config channel wants its listener.
    OpenTunnel(Arc<Tunnel>),
    CloseTunnel(i32),
    /// Agent went away; its ingress listeners should stop.
    AgentClosed(i32),
    /// A SECRET work channel arrived; the proxy layer matches it to a
    /// secret-mode tunnel by password digest.
    Secret {
        password_digest: String,
        conn: BoxedStream,
        peer: SocketAddr,
    },
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Gate `send_link_info` on the registered-IPs map.
    pub ip_verify: bool,
    /// Mux idle disconnect, seconds.
    pub disconnect_timeout: u64,
    /// Advertised UDP rendezvous endpoint, e.g. `203.0.113.1:6000`.
    pub p2p_endpoint: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ip_verify: false,
            disconnect_timeout: 60,
            p2p_endpoint: None,
        }
    }
}

pub struct Bridge {
    pub store: Arc<Store>,
    config: BridgeConfig,
    sessions: Mutex<HashMap<i32, AgentSession>>,
    registered_ips: Mutex<HashMap<String, DateTime<Utc>>>,
    events: mpsc::Sender<BridgeEvent>,
}

impl Bridge {
    pub fn new(
        store: Arc<Store>,
        config: BridgeConfig,
    ) -> (Arc<Self>, mpsc::Receiver<BridgeEvent>) {
        let (events, rx) = mpsc::channel(16);
        (
            Arc::new(Self {
                store,
                config,
                sessions: Mutex::new(HashMap::new()),
                registered_ips: Mutex::new(HashMap::new()),
                events,
            }),
            rx,
        )
    }

    fn mux_idle(&self) -> Duration {
        Duration::from_secs(self.config.disconnect_timeout.max(1))
    }

    /// Process one inbound bridge connection through handshake and
    /// work-type dispatch. Errors close the connection; they never take the
    /// bridge down.
    pub async fn handle_conn(self: &Arc<Self>, stream: BoxedStream, peer: SocketAddr) {
        if let Err(e) = self.process(stream, peer).await {
            debug!(%peer, "bridge connection ended: {}", e);
        }
    }

    async fn process(self: &Arc<Self>, stream: BoxedStream, peer: SocketAddr) -> Result<(), BridgeError> {
        let mut framed = FramedStream::new(stream);

        // connection probe, discarded
        framed.read_exact_content(3).await?;

        let core = framed.read_len_content().await?;
        if core != consts::CORE_VERSION.as_bytes() {
            info!(%peer, "agent core version mismatch, closing");
            return Err(BridgeError::VersionMismatch);
        }
        let display = String::from_utf8_lossy(&framed.read_len_content().await?).to_string();

        framed.write_raw(md5_hex(consts::CORE_VERSION).as_bytes()).await?;

        let digest = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.read_exact_content(32))
            .await
            .map_err(|_| BridgeError::HandshakeTimeout)??;
        let digest = String::from_utf8_lossy(&digest).to_string();

        let agent = match self
            .store
            .find_agent_by_verify_key(&digest, &peer.to_string())
        {
            Ok(agent) => {
                framed.write_flag(consts::VERIFY_SUCCESS).await?;
                agent
            }
            Err(e) => {
                info!(%peer, "agent verification failed, closing");
                framed.write_flag(consts::VERIFY_ERROR).await?;
                return Err(e.into());
            }
        };

        let flag = framed.read_flag().await?;
        self.dispatch(flag, framed, agent.id, display, peer).await
    }

    async fn dispatch(
        self: &Arc<Self>,
        flag: [u8; 4],
        mut framed: FramedStream<BoxedStream>,
        agent_id: i32,
        version: String,
        peer: SocketAddr,
    ) -> Result<(), BridgeError> {
        let is_public = self.store.is_public_agent(agent_id);
        match flag {
            consts::WORK_MAIN => {
                if is_public {
                    return Ok(());
                }
                self.attach_signal(agent_id, framed.into_inner(), version, peer)
                    .await;
            }
            consts::WORK_CHAN => {
                let mux = Arc::new(Mux::new(framed.into_inner(), MuxSide::Server, self.mux_idle()));
                self.with_session(agent_id, |s| s.tunnel = Some(mux.clone()));
                debug!(agent_id, %peer, "tunnel mux attached");
            }
            consts::WORK_FILE => {
                let mux = Arc::new(Mux::new(framed.into_inner(), MuxSide::Server, self.mux_idle()));
                self.with_session(agent_id, |s| s.file = Some(mux.clone()));
                debug!(agent_id, %peer, "file mux attached");
            }
            consts::WORK_CONFIG => {
                let agent = self.store.get_agent(agent_id)?;
                if !is_public && !agent.profile().allow_config_channel {
                    return Ok(());
                }
                framed.write_bool(is_public).await?;
                self.clone()
                    .run_config_channel(framed, agent, is_public)
                    .await;
            }
            consts::WORK_REGISTER => {
                let hours = framed.read_i32().await?;
                self.register_ip(ip_of(&peer.to_string()), hours);
            }
            consts::WORK_SECRET => {
                let digest = framed.read_exact_content(32).await?;
                let password_digest = String::from_utf8_lossy(&digest).to_string();
                let _ = self
                    .events
                    .send(BridgeEvent::Secret {
                        password_digest,
                        conn: framed.into_inner(),
                        peer,
                    })
                    .await;
            }
            consts::WORK_P2P => {
                let digest = framed.read_exact_content(32).await?;
                let digest = String::from_utf8_lossy(&digest).to_string();
                self.signal_p2p(&digest, &mut framed).await?;
            }
            other => {
                warn!(agent_id, flag = ?other, "unknown work type");
            }
        }
        Ok(())
    }

    /// MAIN: this connection becomes the session's signal. A re-login
    /// displaces the previous signal with a close token.
    async fn attach_signal(
        self: &Arc<Self>,
        agent_id: i32,
        stream: BoxedStream,
        version: String,
        peer: SocketAddr,
    ) {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer = SignalWriter::new(write_half);

        let displaced = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions.entry(agent_id).or_default();
            let old = session.signal.replace(writer.clone());
            session.version = version;
            session.retries = 0;
            if let Some(task) = session.health_task.take() {
                task.abort();
            }
            old
        };
        if let Some(old) = displaced {
            let _ = old.write_flag(consts::RES_CLOSE).await;
            debug!(agent_id, "previous signal displaced");
        }

        let bridge = self.clone();
        let task = tokio::spawn(async move {
            bridge
                .health_loop(agent_id, FramedStream::new(read_half))
                .await;
        });
        self.with_session(agent_id, |s| s.health_task = Some(task));
        info!(agent_id, %peer, "agent signal connected");
    }

    pub(crate) fn with_session<F: FnOnce(&mut AgentSession)>(&self, agent_id: i32, f: F) {
        let mut sessions = self.sessions.lock().unwrap();
        f(sessions.entry(agent_id).or_default())
    }

    fn register_ip(&self, ip: &str, hours: i32) {
        let expiry = Utc::now() + ChronoDuration::hours(hours.max(0) as i64);
        self.registered_ips
            .lock()
            .unwrap()
            .insert(ip.to_string(), expiry);
        info!(ip, hours, "source ip registered");
    }

    fn check_registered(&self, remote_addr: &str) -> Result<(), BridgeError> {
        let ip = ip_of(remote_addr).to_string();
        match self.registered_ips.lock().unwrap().get(&ip) {
            None => Err(BridgeError::IpNotRegistered(ip)),
            Some(expiry) if *expiry <= Utc::now() => Err(BridgeError::IpExpired(ip)),
            Some(_) => Ok(()),
        }
    }

    /// P2P work type: point both the tunnel owner and the visitor at the
    /// UDP rendezvous. An offline owner closes the visitor silently.
    async fn signal_p2p(
        &self,
        password_digest: &str,
        visitor: &mut FramedStream<BoxedStream>,
    ) -> Result<(), BridgeError> {
        let Some(endpoint) = self.config.p2p_endpoint.clone() else {
            return Ok(());
        };
        let Some(tunnel) = self.store.get_tunnel_by_md5_password(password_digest) else {
            warn!("p2p request with unknown password digest");
            return Ok(());
        };
        let signal = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(&tunnel.agent_id).and_then(|s| s.signal.clone())
        };
        let Some(signal) = signal else {
            return Ok(());
        };
        signal.write_flag(consts::NEW_UDP_CONN).await?;
        signal.write_len_content(endpoint.as_bytes()).await?;
        signal.write_len_content(password_digest.as_bytes()).await?;
        visitor.write_len_content(endpoint.as_bytes()).await?;
        Ok(())
    }

    /// Open a stream to the agent for one public flow and hand it to the
    /// proxy fabric with the link descriptor already written.
    pub async fn send_link_info(
        &self,
        agent_id: i32,
        mut link: Link,
        mode: Option<TunnelMode>,
    ) -> Result<BoxedStream, BridgeError> {
        if link.local_proxy {
            let conn = tokio::time::timeout(link.dial_timeout(), TcpStream::connect(&link.host))
                .await
                .map_err(|_| BridgeError::DialTimeout(link.host.clone()))??;
            return Ok(Box::new(conn));
        }

        if self.config.ip_verify {
            self.check_registered(&link.remote_addr)?;
        }

        let is_file = mode == Some(TunnelMode::File);
        let mux = {
            let sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get(&agent_id)
                .ok_or(BridgeError::AgentNotConnected(agent_id))?;
            let mux = if is_file { &session.file } else { &session.tunnel };
            mux.clone()
                .ok_or(BridgeError::AgentNotConnected(agent_id))?
        };
        if mux.is_closed() {
            return Err(BridgeError::AgentNotConnected(agent_id));
        }

        let stream = mux.open_stream()?;
        if is_file {
            // file streams move bulk data; crypt/compress stay off
            link.crypt = false;
            link.compress = false;
        }
        let mut framed = FramedStream::new(stream);
        framed.send_json(&link).await?;
        Ok(Box::new(framed.into_inner()))
    }

    /// One heartbeat pass: bump miss counters and return the agents whose
    /// sessions expired (3 consecutive misses, or a mux reporting closed).
    pub fn sweep_sessions(&self) -> Vec<i32> {
        let mut sessions = self.sessions.lock().unwrap();
        let mut stale = Vec::new();
        for (id, session) in sessions.iter_mut() {
            let mux_dead = session
                .tunnel
                .as_ref()
                .map(|m| m.is_closed())
                .unwrap_or(false);
            if mux_dead {
                stale.push(*id);
                continue;
            }
            if session.signal.is_none() || session.tunnel.is_none() {
                session.retries += 1;
                if session.retries >= HEARTBEAT_MAX_MISSES {
                    stale.push(*id);
                }
            } else {
                session.retries = 0;
            }
        }
        stale
    }

    /// Periodic session sweep: three consecutive checks with a missing
    /// signal or tunnel mux, or a mux reporting closed, tear the agent down.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                for id in bridge.sweep_sessions() {
                    info!(agent_id = id, "agent session expired");
                    bridge.del_agent(id).await;
                }
            }
        })
    }

    /// Tear down an agent's session and tell the supervisor to stop its
    /// ingress listeners (unless it is the hidden public-pool agent).
    pub async fn del_agent(&self, agent_id: i32) {
        let existed = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.remove(&agent_id) {
                Some(mut session) => {
                    session.teardown();
                    true
                }
                None => false,
            }
        };
        if existed && !self.store.is_public_agent(agent_id) {
            let _ = self.events.send(BridgeEvent::AgentClosed(agent_id)).await;
        }
    }

    pub async fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event).await;
    }

    pub fn is_online(&self, agent_id: i32) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .get(&agent_id)
            .map(|s| s.signal.is_some())
            .unwrap_or(false)
    }

    pub fn online_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.signal.is_some())
            .count()
    }

    pub fn agent_version(&self, agent_id: i32) -> Option<String> {
        self.sessions
            .lock()
            .unwrap()
            .get(&agent_id)
            .map(|s| s.version.clone())
    }

    /// Number of heartbeat misses recorded for a session; test hook.
    pub fn session_retries(&self, agent_id: i32) -> Option<u32> {
        self.sessions.lock().unwrap().get(&agent_id).map(|s| s.retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverb_store::AgentProfile;

    fn bridge_with_agent() -> (Arc<Bridge>, i32) {
        let store = Arc::new(Store::new());
        let agent = store
            .create_agent("kkkkkkkkkkkkkkkk".into(), AgentProfile::default())
            .unwrap();
        let (bridge, _events) = Bridge::new(store, BridgeConfig::default());
        (bridge, agent.id)
    }

    #[tokio::test]
    async fn sweep_expires_session_after_three_misses() {
        let (bridge, id) = bridge_with_agent();
        bridge.with_session(id, |_| {}); // session with neither signal nor mux

        assert!(bridge.sweep_sessions().is_empty());
        assert!(bridge.sweep_sessions().is_empty());
        assert_eq!(bridge.session_retries(id), Some(2));
        assert_eq!(bridge.sweep_sessions(), vec![id]);
    }

    #[tokio::test]
    async fn closed_mux_expires_immediately() {
        let (bridge, id) = bridge_with_agent();
        let (carrier, _peer) = tokio::io::duplex(1024);
        let mux = Arc::new(Mux::new(
            carrier,
            reverb_proto::MuxSide::Server,
            Duration::from_secs(60),
        ));
        mux.close();
        bridge.with_session(id, |s| s.tunnel = Some(mux.clone()));

        assert_eq!(bridge.sweep_sessions(), vec![id]);
    }

    #[tokio::test]
    async fn send_link_info_fails_for_unknown_agent() {
        let (bridge, _) = bridge_with_agent();
        let link = Link::new("tcp", "127.0.0.1:1", false, false, "1.2.3.4:5", false);
        assert!(matches!(
            bridge.send_link_info(999, link, None).await,
            Err(BridgeError::AgentNotConnected(999))
        ));
    }

    #[tokio::test]
    async fn ip_verify_gates_unregistered_sources() {
        let store = Arc::new(Store::new());
        let agent = store
            .create_agent("jjjjjjjjjjjjjjjj".into(), AgentProfile::default())
            .unwrap();
        let (bridge, _events) = Bridge::new(
            store,
            BridgeConfig {
                ip_verify: true,
                ..Default::default()
            },
        );
        // attach a live mux so the gate is the only failure mode
        let (carrier, peer_side) = tokio::io::duplex(8192);
        let mux = Arc::new(Mux::new(
            carrier,
            reverb_proto::MuxSide::Server,
            Duration::from_secs(60),
        ));
        let _peer_mux = Mux::new(peer_side, reverb_proto::MuxSide::Client, Duration::from_secs(60));
        bridge.with_session(agent.id, |s| s.tunnel = Some(mux.clone()));

        let link = Link::new("tcp", "127.0.0.1:1", false, false, "9.9.9.9:1000", false);
        assert!(matches!(
            bridge.send_link_info(agent.id, link, None).await,
            Err(BridgeError::IpNotRegistered(_))
        ));

        bridge.register_ip("9.9.9.9", 1);
        let link = Link::new("tcp", "127.0.0.1:1", false, false, "9.9.9.9:1000", false);
        assert!(bridge.send_link_info(agent.id, link, None).await.is_ok());
    }

    #[tokio::test]
    async fn expired_registration_is_rejected() {
        let store = Arc::new(Store::new());
        let agent = store
            .create_agent("hhhhhhhhhhhhhhhh".into(), AgentProfile::default())
            .unwrap();
        let (bridge, _events) = Bridge::new(
            store,
            BridgeConfig {
                ip_verify: true,
                ..Default::default()
            },
        );
        let (carrier, peer_side) = tokio::io::duplex(8192);
        let mux = Arc::new(Mux::new(
            carrier,
            reverb_proto::MuxSide::Server,
            Duration::from_secs(60),
        ));
        let _peer_mux = Mux::new(peer_side, reverb_proto::MuxSide::Client, Duration::from_secs(60));
        bridge.with_session(agent.id, |s| s.tunnel = Some(mux.clone()));

        bridge.register_ip("8.8.8.8", 0); // expires immediately
        let link = Link::new("tcp", "127.0.0.1:1", false, false, "8.8.8.8:7", false);
        assert!(matches!(
            bridge.send_link_info(agent.id, link, None).await,
            Err(BridgeError::IpExpired(_))
        ));
    }
}
