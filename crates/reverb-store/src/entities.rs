//! Catalog records: agents, tunnels and vhosts.
//!
//! Records are shared as `Arc`s; ownership between entities is by id only
//! (a tunnel stores `agent_id`, never a back-pointer), so the repository is
//! the single place resolving relationships. Hot counters are atomics, the
//! admin-editable slow state sits behind one `RwLock` per agent.

use crate::pool::TargetPool;
use reverb_proto::rate::{RateLimiter, DEFAULT_RATE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

/// Byte counters for one agent, tunnel or host.
#[derive(Debug, Default)]
pub struct Flow {
    inlet: AtomicI64,
    export: AtomicI64,
}

impl Flow {
    pub fn add(&self, inlet: i64, export: i64) {
        if inlet != 0 {
            self.inlet.fetch_add(inlet, Ordering::Relaxed);
        }
        if export != 0 {
            self.export.fetch_add(export, Ordering::Relaxed);
        }
    }

    pub fn inlet(&self) -> i64 {
        self.inlet.load(Ordering::Relaxed)
    }

    pub fn export(&self) -> i64 {
        self.export.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> i64 {
        self.inlet() + self.export()
    }
}

/// Admin-editable agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub remark: String,
    /// Basic-auth credentials checked on HTTP/SOCKS5 flows.
    pub auth_user: String,
    pub auth_password: String,
    /// Whether flows for this agent are TLS-wrapped / snappy-compressed on
    /// the mux (the link descriptor mirrors these).
    pub crypt: bool,
    pub compress: bool,
    pub enabled: bool,
    /// KiB/s; 0 selects the 16 MiB/s default.
    pub rate_limit: i64,
    /// Concurrent flows; 0 = unlimited.
    pub max_conn: i32,
    /// Tunnels this agent may register; 0 = unlimited.
    pub max_tunnels: i32,
    /// MiB of inlet+export after which flows are refused; 0 = unlimited.
    pub flow_limit: i64,
    pub allow_config_channel: bool,
    /// Web login for the agent-scoped admin role.
    pub web_username: String,
    pub web_password: String,
    /// Hidden public-pool entry.
    pub no_display: bool,
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            remark: String::new(),
            auth_user: String::new(),
            auth_password: String::new(),
            crypt: false,
            compress: false,
            enabled: true,
            rate_limit: 0,
            max_conn: 0,
            max_tunnels: 0,
            flow_limit: 0,
            allow_config_channel: false,
            web_username: String::new(),
            web_password: String::new(),
            no_display: false,
        }
    }
}

/// A remote agent: one persistent outbound session, owner of tunnels and
/// hosts.
pub struct Agent {
    pub id: i32,
    pub verify_key: String,
    profile: RwLock<AgentProfile>,
    pub flow: Arc<Flow>,
    now_conn: AtomicI32,
    rate: RwLock<Arc<RateLimiter>>,
    /// Last peer IP seen during verification.
    addr: RwLock<String>,
}

impl Agent {
    pub fn new(id: i32, verify_key: String, profile: AgentProfile) -> Self {
        let rate = make_rate(profile.rate_limit);
        Self {
            id,
            verify_key,
            profile: RwLock::new(profile),
            flow: Arc::new(Flow::default()),
            now_conn: AtomicI32::new(0),
            rate: RwLock::new(rate),
            addr: RwLock::new(String::new()),
        }
    }

    pub fn profile(&self) -> AgentProfile {
        self.profile.read().unwrap().clone()
    }

    pub fn set_profile(&self, profile: AgentProfile) {
        let rate_changed = {
            let cur = self.profile.read().unwrap();
            cur.rate_limit != profile.rate_limit
        };
        if rate_changed {
            *self.rate.write().unwrap() = make_rate(profile.rate_limit);
        }
        *self.profile.write().unwrap() = profile;
    }

    pub fn enabled(&self) -> bool {
        self.profile.read().unwrap().enabled
    }

    pub fn rate(&self) -> Arc<RateLimiter> {
        self.rate.read().unwrap().clone()
    }

    pub fn addr(&self) -> String {
        self.addr.read().unwrap().clone()
    }

    pub fn set_addr(&self, addr: &str) {
        *self.addr.write().unwrap() = addr.to_string();
    }

    pub fn now_conn(&self) -> i32 {
        self.now_conn.load(Ordering::Acquire)
    }

    /// Reserve a flow slot; compare-and-increment against `max_conn`.
    pub fn try_acquire_conn(&self) -> bool {
        let max = self.profile.read().unwrap().max_conn;
        let mut cur = self.now_conn.load(Ordering::Acquire);
        loop {
            if max != 0 && cur >= max {
                return false;
            }
            match self.now_conn.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn release_conn(&self) {
        self.now_conn.fetch_sub(1, Ordering::AcqRel);
    }

    /// True once inlet+export crossed the configured quota.
    pub fn over_flow_limit(&self) -> bool {
        let limit = self.profile.read().unwrap().flow_limit;
        limit > 0 && self.flow.total() >= (limit << 20)
    }
}

fn make_rate(rate_limit_kib: i64) -> Arc<RateLimiter> {
    if rate_limit_kib > 0 {
        RateLimiter::new(rate_limit_kib * 1024)
    } else {
        RateLimiter::new(DEFAULT_RATE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelMode {
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "httpProxy")]
    HttpProxy,
    #[serde(rename = "socks5")]
    Socks5,
    #[serde(rename = "secret")]
    Secret,
    #[serde(rename = "p2p")]
    P2p,
    #[serde(rename = "file")]
    File,
    #[serde(rename = "tcpTrans")]
    TcpTrans,
}

impl TunnelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelMode::Tcp => "tcp",
            TunnelMode::Udp => "udp",
            TunnelMode::HttpProxy => "httpProxy",
            TunnelMode::Socks5 => "socks5",
            TunnelMode::Secret => "secret",
            TunnelMode::P2p => "p2p",
            TunnelMode::File => "file",
            TunnelMode::TcpTrans => "tcpTrans",
        }
    }

    /// Modes with no public listener of their own.
    pub fn is_listenerless(&self) -> bool {
        matches!(self, TunnelMode::Secret | TunnelMode::P2p)
    }
}

impl std::str::FromStr for TunnelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(TunnelMode::Tcp),
            "udp" => Ok(TunnelMode::Udp),
            "httpProxy" => Ok(TunnelMode::HttpProxy),
            "socks5" => Ok(TunnelMode::Socks5),
            "secret" => Ok(TunnelMode::Secret),
            "p2p" => Ok(TunnelMode::P2p),
            "file" => Ok(TunnelMode::File),
            "tcpTrans" => Ok(TunnelMode::TcpTrans),
            other => Err(format!("unknown tunnel mode {other}")),
        }
    }
}

/// Health probe settings carried by tunnels and hosts; the agent is the
/// prober, the server only ingests results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthConfig {
    /// "tcp" or "http"; empty disables probing.
    pub check_type: String,
    pub timeout_secs: u64,
    pub interval_secs: u64,
    pub max_fail: u32,
    /// Appended to the target for http probes.
    pub check_url: String,
}

/// A public ingress binding owned by one agent.
pub struct Tunnel {
    pub id: i32,
    pub agent_id: i32,
    pub mode: TunnelMode,
    /// 0 for secret/p2p.
    pub port: u16,
    pub server_ip: String,
    /// Used only by secret/p2p pairing.
    pub password: String,
    pub remark: String,
    pub targets: TargetPool,
    pub flow: Arc<Flow>,
    /// File-mode root and URL prefix strip.
    pub local_path: String,
    pub strip_prefix: String,
    /// SOCKS5 multi-account map; takes precedence over agent credentials.
    pub multi_accounts: Option<HashMap<String, String>>,
    pub health: HealthConfig,
    enabled: AtomicBool,
    /// Registered via the config channel rather than the admin.
    pub no_store: bool,
}

impl Tunnel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: i32,
        agent_id: i32,
        mode: TunnelMode,
        port: u16,
        server_ip: &str,
        target_spec: &str,
        local_proxy: bool,
    ) -> Self {
        Self {
            id,
            agent_id,
            mode,
            port,
            server_ip: server_ip.to_string(),
            password: String::new(),
            remark: String::new(),
            targets: TargetPool::new(target_spec, local_proxy),
            flow: Arc::new(Flow::default()),
            local_path: String::new(),
            strip_prefix: String::new(),
            multi_accounts: None,
            health: HealthConfig::default(),
            enabled: AtomicBool::new(true),
            no_store: false,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, v: bool) {
        self.enabled.store(v, Ordering::Release);
    }

    pub fn bind_addr(&self) -> String {
        let ip = if self.server_ip.is_empty() {
            "0.0.0.0"
        } else {
            &self.server_ip
        };
        format!("{ip}:{}", self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostScheme {
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "https")]
    Https,
    #[serde(rename = "all")]
    All,
}

impl HostScheme {
    pub fn matches(&self, request_scheme: &str) -> bool {
        match self {
            HostScheme::All => true,
            HostScheme::Http => request_scheme == "http",
            HostScheme::Https => request_scheme == "https",
        }
    }

    /// Whether two rules collide: `all` conflicts with everything.
    pub fn conflicts(&self, other: &HostScheme) -> bool {
        *self == HostScheme::All || *other == HostScheme::All || self == other
    }
}

impl std::str::FromStr for HostScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "all" => Ok(HostScheme::All),
            "http" => Ok(HostScheme::Http),
            "https" => Ok(HostScheme::Https),
            other => Err(format!("unknown scheme {other}")),
        }
    }
}

/// An HTTP/HTTPS vhost rule owned by one agent.
pub struct Host {
    pub id: i32,
    pub agent_id: i32,
    /// Exact name or `*.`-wildcard pattern.
    pub host: String,
    /// URL prefix, default `/`.
    pub location: String,
    pub scheme: HostScheme,
    pub remark: String,
    pub targets: TargetPool,
    pub flow: Arc<Flow>,
    /// Host header replacement for forwarded requests.
    pub host_rewrite: String,
    /// Extra request headers, newline-separated `name:value` pairs.
    pub extra_headers: String,
    pub cert_path: String,
    pub key_path: String,
    pub health: HealthConfig,
    enabled: AtomicBool,
    pub no_store: bool,
}

impl Host {
    pub fn new(id: i32, agent_id: i32, host: &str, location: &str, scheme: HostScheme, target_spec: &str) -> Self {
        let location = if location.is_empty() { "/" } else { location };
        Self {
            id,
            agent_id,
            host: host.to_string(),
            location: location.to_string(),
            scheme,
            remark: String::new(),
            targets: TargetPool::new(target_spec, false),
            flow: Arc::new(Flow::default()),
            host_rewrite: String::new(),
            extra_headers: String::new(),
            cert_path: String::new(),
            key_path: String::new(),
            health: HealthConfig::default(),
            enabled: AtomicBool::new(true),
            no_store: false,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, v: bool) {
        self.enabled.store(v, Ordering::Release);
    }

    /// Exact or `*`-wildcard match against a request host (port stripped by
    /// the caller). A wildcard never matches the bare apex.
    pub fn matches_host(&self, request_host: &str) -> bool {
        if self.host.contains('*') {
            let suffix = self.host.replace('*', "");
            request_host.contains(&suffix)
        } else {
            self.host == request_host
        }
    }
}
