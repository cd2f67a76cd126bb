//! Agent config channel: self-registration of agents, vhosts and tunnels
//! over the CONF work type.
//!
//! The loop reads sub-flags until the agent hangs up or an operation fails;
//! each NEW_* writes a one-byte status back, and any failure terminates the
//! loop and deletes the agent it was building.

use crate::bridge::{Bridge, BridgeEvent};
use reverb_proto::{consts, BoxedStream, FramedStream};
use reverb_store::{expand_ports, Agent, AgentProfile, Host, HostScheme, Tunnel, TunnelMode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct AgentPayload {
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub crypt: bool,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub auth_user: String,
    #[serde(default)]
    pub auth_password: String,
}

#[derive(Debug, Deserialize)]
pub struct HostPayload {
    pub host: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub scheme: String,
    pub target: String,
    #[serde(default)]
    pub host_rewrite: String,
    #[serde(default)]
    pub extra_headers: String,
    #[serde(default)]
    pub remark: String,
}

#[derive(Debug, Deserialize)]
pub struct TunnelPayload {
    pub mode: String,
    #[serde(default)]
    pub ports: String,
    #[serde(default)]
    pub server_ip: String,
    #[serde(default)]
    pub targets: String,
    #[serde(default)]
    pub target_addr: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub local_path: String,
    #[serde(default)]
    pub strip_prefix: String,
    #[serde(default)]
    pub multi_accounts: Option<HashMap<String, String>>,
}

impl Bridge {
    /// Run the CONF sub-protocol until EOF or failure. `agent` starts as
    /// the authenticated agent and is replaced when NEW_CONF registers a
    /// fresh one.
    pub(crate) async fn run_config_channel(
        self: Arc<Self>,
        mut framed: FramedStream<BoxedStream>,
        mut agent: Arc<Agent>,
        is_public: bool,
    ) {
        let mut created_agent = false;
        let mut failed = false;

        loop {
            let flag = match framed.read_flag().await {
                Ok(f) => f,
                Err(_) => break,
            };
            match flag {
                consts::WORK_STATUS => {
                    if self.reply_status(&mut framed).await.is_err() {
                        break;
                    }
                }
                consts::NEW_CONF => match self.new_agent(&mut framed).await {
                    Ok(a) => {
                        agent = a;
                        created_agent = true;
                    }
                    Err(e) => {
                        warn!("config channel: agent registration failed: {}", e);
                        let _ = framed.write_bool(false).await;
                        failed = true;
                        break;
                    }
                },
                consts::NEW_HOST => {
                    if let Err(e) = self.new_host(&mut framed, &agent).await {
                        warn!("config channel: host registration failed: {}", e);
                        let _ = framed.write_bool(false).await;
                        failed = true;
                        break;
                    }
                }
                consts::NEW_TASK => {
                    if let Err(e) = self.new_task(&mut framed, &agent).await {
                        warn!("config channel: tunnel registration failed: {}", e);
                        let _ = framed.write_bool(false).await;
                        failed = true;
                        break;
                    }
                }
                other => {
                    debug!(flag = ?other, "config channel: unknown sub-flag");
                    break;
                }
            }
        }

        if failed && (created_agent || !is_public) {
            let _ = self.store.delete_agent(agent.id);
            self.del_agent(agent.id).await;
        }
    }

    /// STATUS: reply with the remarks of everything currently registered
    /// for the agent identified by a follow-up md5 digest.
    async fn reply_status(
        &self,
        framed: &mut FramedStream<BoxedStream>,
    ) -> Result<(), crate::bridge::BridgeError> {
        let digest = framed.read_exact_content(32).await?;
        let digest = String::from_utf8_lossy(&digest);
        let agent = self.store.find_agent_by_md5_verify_key(&digest)?;

        let mut joined = String::new();
        for host in self.store.hosts_for_agent(agent.id) {
            joined.push_str(&host.remark);
            joined.push_str(consts::CONN_DATA_SEQ);
        }
        for tunnel in self.store.tunnels_for_agent(agent.id) {
            joined.push_str(&tunnel.remark);
            joined.push_str(consts::CONN_DATA_SEQ);
        }
        framed.write_len_content(joined.as_bytes()).await?;
        Ok(())
    }

    /// NEW_CONF: create an agent and reply OK plus the server-assigned
    /// verify key; the session table gets an empty placeholder entry.
    async fn new_agent(
        &self,
        framed: &mut FramedStream<BoxedStream>,
    ) -> Result<Arc<Agent>, crate::bridge::BridgeError> {
        let payload: AgentPayload = framed.read_json().await?;
        let profile = AgentProfile {
            remark: payload.remark,
            crypt: payload.crypt,
            compress: payload.compress,
            auth_user: payload.auth_user,
            auth_password: payload.auth_password,
            ..Default::default()
        };
        let agent = self.store.create_agent(String::new(), profile)?;
        framed.write_bool(true).await?;
        framed.write_raw(agent.verify_key.as_bytes()).await?;
        self.with_session(agent.id, |_| {});
        info!(agent_id = agent.id, "agent registered over config channel");
        Ok(agent)
    }

    /// NEW_HOST: bind a vhost rule to the current agent; duplicates fail.
    async fn new_host(
        &self,
        framed: &mut FramedStream<BoxedStream>,
        agent: &Arc<Agent>,
    ) -> Result<(), crate::bridge::BridgeError> {
        let payload: HostPayload = framed.read_json().await?;
        let scheme: HostScheme = payload
            .scheme
            .parse()
            .map_err(reverb_store::StoreError::InvalidInput)?;
        let location = if payload.location.is_empty() {
            "/"
        } else {
            &payload.location
        };
        let mut host = Host::new(
            self.store.alloc_host_id(),
            agent.id,
            &payload.host,
            location,
            scheme,
            &payload.target,
        );
        host.host_rewrite = payload.host_rewrite;
        host.extra_headers = payload.extra_headers;
        host.remark = payload.remark;
        host.no_store = true;
        self.store.create_host(host)?;
        framed.write_bool(true).await?;
        Ok(())
    }

    /// NEW_TASK: expand the port spec into one tunnel per port, pre-flight
    /// each public port, register and hand to the supervisor.
    async fn new_task(
        self: &Arc<Self>,
        framed: &mut FramedStream<BoxedStream>,
        agent: &Arc<Agent>,
    ) -> Result<(), crate::bridge::BridgeError> {
        let payload: TunnelPayload = framed.read_json().await?;
        let mode: TunnelMode = payload
            .mode
            .parse()
            .map_err(reverb_store::StoreError::InvalidInput)?;

        let mut ports = expand_ports(&payload.ports);
        let target_ports = expand_ports(&payload.targets);
        // multi-port rows pair each port with a target port, which only the
        // tcp/udp modes define
        if ports.len() > 1 {
            if !matches!(mode, TunnelMode::Tcp | TunnelMode::Udp) {
                return Err(reverb_store::StoreError::InvalidInput(format!(
                    "mode {} does not support multiple ports",
                    mode.as_str()
                ))
                .into());
            }
            if ports.len() != target_ports.len() {
                return Err(reverb_store::StoreError::InvalidInput(
                    "port count must equal target count".into(),
                )
                .into());
            }
        }
        if mode.is_listenerless() {
            ports = vec![0];
        }
        if ports.is_empty() {
            return Err(reverb_store::StoreError::InvalidInput("no ports given".into()).into());
        }

        let multi = ports.len() > 1;
        for (i, port) in ports.iter().enumerate() {
            let target_spec = if multi {
                if payload.target_addr.is_empty() {
                    target_ports[i].to_string()
                } else {
                    format!("{}:{}", payload.target_addr, target_ports[i])
                }
            } else {
                payload.targets.clone()
            };

            if self.store.agent_has_tunnel_on_port(agent.id, *port) {
                framed.write_bool(true).await?;
                continue;
            }

            let mut tunnel = Tunnel::new(
                self.store.alloc_tunnel_id(),
                agent.id,
                mode,
                *port,
                &payload.server_ip,
                &target_spec,
                false,
            );
            tunnel.remark = if multi {
                format!("{}_{}", payload.remark, port)
            } else {
                payload.remark.clone()
            };
            tunnel.password = payload.password.clone();
            tunnel.local_path = payload.local_path.clone();
            tunnel.strip_prefix = payload.strip_prefix.clone();
            tunnel.multi_accounts = payload.multi_accounts.clone();
            tunnel.no_store = true;

            if !mode.is_listenerless() && !test_port_open(&tunnel.bind_addr(), mode).await {
                return Err(reverb_store::StoreError::InvalidInput(format!(
                    "port {port} cannot be opened"
                ))
                .into());
            }

            let tunnel = self.store.create_tunnel(tunnel)?;
            self.emit(BridgeEvent::OpenTunnel(tunnel)).await;
            framed.write_bool(true).await?;
        }
        Ok(())
    }
}

/// Pre-flight check that a public port can be bound right now.
pub async fn test_port_open(addr: &str, mode: TunnelMode) -> bool {
    match mode {
        TunnelMode::Udp => tokio::net::UdpSocket::bind(addr).await.is_ok(),
        _ => tokio::net::TcpListener::bind(addr).await.is_ok(),
    }
}
