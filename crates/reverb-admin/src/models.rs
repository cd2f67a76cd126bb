//! Request forms and response views for the admin surface.

use reverb_bridge::Bridge;
use reverb_store::{Agent, Host, Tunnel};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// `{code: 1, msg, data}` success envelope.
pub fn ok(data: serde_json::Value) -> axum::Json<serde_json::Value> {
    axum::Json(json!({ "code": 1, "msg": "success", "data": data }))
}

/// `{code: 0, msg}` failure envelope; admin errors never disturb the fabric.
pub fn fail(msg: impl std::fmt::Display) -> axum::Json<serde_json::Value> {
    axum::Json(json!({ "code": 0, "msg": msg.to_string() }))
}

#[derive(Debug, Deserialize)]
pub struct ListForm {
    #[serde(default)]
    pub start: usize,
    #[serde(default)]
    pub length: usize,
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub sort: String,
    #[serde(default)]
    pub order: String,
}

#[derive(Debug, Deserialize)]
pub struct IdForm {
    pub id: i32,
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ClientForm {
    #[serde(default)]
    pub id: i32,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub vkey: String,
    #[serde(default)]
    pub auth_user: String,
    #[serde(default)]
    pub auth_password: String,
    #[serde(default)]
    pub crypt: bool,
    #[serde(default)]
    pub compress: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rate_limit: i64,
    #[serde(default)]
    pub max_conn: i32,
    #[serde(default)]
    pub max_tunnels: i32,
    #[serde(default)]
    pub flow_limit: i64,
    #[serde(default)]
    pub allow_config_channel: bool,
    #[serde(default)]
    pub web_username: String,
    #[serde(default)]
    pub web_password: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct TunnelForm {
    #[serde(default)]
    pub id: i32,
    pub client_id: i32,
    pub mode: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub server_ip: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub local_path: String,
    #[serde(default)]
    pub strip_prefix: String,
    #[serde(default)]
    pub local_proxy: bool,
    /// `user:pass` lines for socks5 multi-account auth.
    #[serde(default)]
    pub multi_account: String,
}

#[derive(Debug, Deserialize)]
pub struct HostForm {
    #[serde(default)]
    pub id: i32,
    pub client_id: i32,
    pub host: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub host_rewrite: String,
    #[serde(default)]
    pub extra_headers: String,
    #[serde(default)]
    pub cert_path: String,
    #[serde(default)]
    pub key_path: String,
}

#[derive(Debug, Serialize)]
pub struct AgentView {
    pub id: i32,
    pub verify_key: String,
    pub remark: String,
    pub addr: String,
    pub enabled: bool,
    pub online: bool,
    pub version: String,
    pub now_conn: i32,
    pub inlet_flow: i64,
    pub export_flow: i64,
    pub rate_limit: i64,
    pub max_conn: i32,
    pub max_tunnels: i32,
    pub flow_limit: i64,
    pub allow_config_channel: bool,
    pub web_username: String,
}

impl AgentView {
    pub fn from(agent: &Arc<Agent>, bridge: &Bridge) -> Self {
        let profile = agent.profile();
        Self {
            id: agent.id,
            verify_key: agent.verify_key.clone(),
            remark: profile.remark,
            addr: agent.addr(),
            enabled: profile.enabled,
            online: bridge.is_online(agent.id),
            version: bridge.agent_version(agent.id).unwrap_or_default(),
            now_conn: agent.now_conn(),
            inlet_flow: agent.flow.inlet(),
            export_flow: agent.flow.export(),
            rate_limit: profile.rate_limit,
            max_conn: profile.max_conn,
            max_tunnels: profile.max_tunnels,
            flow_limit: profile.flow_limit,
            allow_config_channel: profile.allow_config_channel,
            web_username: profile.web_username,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TunnelView {
    pub id: i32,
    pub client_id: i32,
    pub mode: String,
    pub port: u16,
    pub server_ip: String,
    pub target: String,
    pub password: String,
    pub remark: String,
    pub enabled: bool,
    pub inlet_flow: i64,
    pub export_flow: i64,
}

impl TunnelView {
    pub fn from(tunnel: &Arc<Tunnel>) -> Self {
        Self {
            id: tunnel.id,
            client_id: tunnel.agent_id,
            mode: tunnel.mode.as_str().to_string(),
            port: tunnel.port,
            server_ip: tunnel.server_ip.clone(),
            target: tunnel.targets.spec().to_string(),
            password: tunnel.password.clone(),
            remark: tunnel.remark.clone(),
            enabled: tunnel.enabled(),
            inlet_flow: tunnel.flow.inlet(),
            export_flow: tunnel.flow.export(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HostView {
    pub id: i32,
    pub client_id: i32,
    pub host: String,
    pub location: String,
    pub scheme: String,
    pub target: String,
    pub remark: String,
    pub enabled: bool,
    pub inlet_flow: i64,
    pub export_flow: i64,
}

impl HostView {
    pub fn from(host: &Arc<Host>) -> Self {
        Self {
            id: host.id,
            client_id: host.agent_id,
            host: host.host.clone(),
            location: host.location.clone(),
            scheme: match host.scheme {
                reverb_store::HostScheme::Http => "http",
                reverb_store::HostScheme::Https => "https",
                reverb_store::HostScheme::All => "all",
            }
            .to_string(),
            target: host.targets.spec().to_string(),
            remark: host.remark.clone(),
            enabled: host.enabled(),
            inlet_flow: host.flow.inlet(),
            export_flow: host.flow.export(),
        }
    }
}
