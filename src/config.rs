//! Server configuration: CLI flags with environment fallbacks.

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

/// Reverse-tunneling proxy server.
#[derive(Parser, Debug, Clone)]
#[command(name = "reverb")]
#[command(about = "Reverse-tunneling proxy server: agents dial out once, the server publishes their services")]
#[command(version)]
pub struct ServerConfig {
    /// Bind IP for the agent bridge listener.
    #[arg(long, env = "REVERB_BRIDGE_IP", default_value = "0.0.0.0")]
    pub bridge_ip: String,

    /// Port agents connect to.
    #[arg(long, env = "REVERB_BRIDGE_PORT", default_value_t = 8024)]
    pub bridge_port: u16,

    /// Public HTTP vhost port; equal to the bridge port shares the socket.
    #[arg(long, env = "REVERB_HTTP_PROXY_PORT")]
    pub http_proxy_port: Option<u16>,

    /// Public HTTPS vhost port; equal to the bridge port shares the socket.
    #[arg(long, env = "REVERB_HTTPS_PROXY_PORT")]
    pub https_proxy_port: Option<u16>,

    /// Hostname that routes shared-port HTTP connections to the admin API.
    #[arg(long, env = "REVERB_ADMIN_HOST", default_value = "")]
    pub admin_host: String,

    /// Admin API port; equal to the bridge port shares the socket.
    #[arg(long, env = "REVERB_ADMIN_PORT")]
    pub admin_port: Option<u16>,

    #[arg(long, env = "REVERB_ADMIN_USERNAME", default_value = "admin")]
    pub admin_username: String,

    #[arg(long, env = "REVERB_ADMIN_PASSWORD", default_value = "")]
    pub admin_password: String,

    /// Shared secret for the timestamped admin auth_key scheme.
    #[arg(long, env = "REVERB_AUTH_KEY", default_value = "")]
    pub auth_key: String,

    /// 16-char key used by /auth/getauthkey to encrypt the auth_key.
    #[arg(long, env = "REVERB_AUTH_CRYPT_KEY", default_value = "")]
    pub auth_crypt_key: String,

    /// Verify key of the hidden public-pool agent.
    #[arg(long, env = "REVERB_PUBLIC_VKEY")]
    pub public_vkey: Option<String>,

    /// Gate flows on the registered-IPs map.
    #[arg(long, env = "REVERB_IP_LIMIT", default_value_t = false)]
    pub ip_limit: bool,

    /// Mux idle disconnect, seconds.
    #[arg(long, env = "REVERB_DISCONNECT_TIMEOUT", default_value_t = 60)]
    pub disconnect_timeout: u64,

    /// Bind IP for the P2P rendezvous sockets.
    #[arg(long, env = "REVERB_P2P_IP", default_value = "0.0.0.0")]
    pub p2p_ip: String,

    /// Base port of the three rendezvous sockets; unset disables P2P.
    #[arg(long, env = "REVERB_P2P_PORT")]
    pub p2p_port: Option<u16>,

    /// Public IP advertised to agents for the rendezvous and to SOCKS5
    /// clients on UDP associate.
    #[arg(long, env = "REVERB_PUBLIC_IP")]
    pub public_ip: Option<IpAddr>,

    /// Cache vhost responses for static-asset URIs.
    #[arg(long, env = "REVERB_HTTP_CACHE", default_value_t = false)]
    pub http_cache: bool,

    /// Cache capacity in entries.
    #[arg(long, env = "REVERB_HTTP_CACHE_LENGTH", default_value_t = 100)]
    pub http_cache_length: usize,

    /// Chain X-Forwarded-For / X-Real-IP onto forwarded requests.
    #[arg(long, env = "REVERB_HTTP_ADD_ORIGIN_HEADER", default_value_t = false)]
    pub http_add_origin_header: bool,

    /// Route HTTPS by SNI without terminating TLS.
    #[arg(long, env = "REVERB_HTTPS_JUST_PROXY", default_value_t = false)]
    pub https_just_proxy: bool,

    /// Fallback certificate for terminated HTTPS.
    #[arg(long, env = "REVERB_HTTPS_DEFAULT_CERT_FILE")]
    pub https_default_cert_file: Option<String>,

    #[arg(long, env = "REVERB_HTTPS_DEFAULT_KEY_FILE")]
    pub https_default_key_file: Option<String>,

    /// Body returned to HTTP clients when an upstream dial fails.
    #[arg(long, env = "REVERB_ERROR_PAGE")]
    pub error_page: Option<PathBuf>,
}

impl ServerConfig {
    /// Whether a surface shares the bridge TCP port.
    pub fn shares_bridge_port(&self, port: Option<u16>) -> bool {
        port == Some(self.bridge_port)
    }

    pub fn needs_port_mux(&self) -> bool {
        self.shares_bridge_port(self.http_proxy_port)
            || self.shares_bridge_port(self.https_proxy_port)
            || self.shares_bridge_port(self.admin_port)
    }

    pub fn bridge_addr(&self) -> String {
        format!("{}:{}", self.bridge_ip, self.bridge_port)
    }

    /// The rendezvous endpoint advertised over the signal connection.
    pub fn p2p_endpoint(&self) -> Option<String> {
        let port = self.p2p_port?;
        let ip = self
            .public_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| self.p2p_ip.clone());
        Some(format!("{ip}:{port}"))
    }

    /// Startup validation; violations are fatal.
    pub fn validate(&self) -> Result<(), String> {
        if self.bridge_port == 0 {
            return Err("bridge_port must be set".into());
        }
        if !self.auth_crypt_key.is_empty() && self.auth_crypt_key.len() != 16 {
            return Err("auth_crypt_key must be exactly 16 characters".into());
        }
        if self.https_default_cert_file.is_some() != self.https_default_key_file.is_some() {
            return Err("https default cert and key must be configured together".into());
        }
        if let Some(path) = &self.https_default_cert_file {
            if !std::path::Path::new(path).exists() {
                return Err(format!("https default cert file {path} does not exist"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ServerConfig {
        ServerConfig::parse_from(["reverb"])
    }

    #[test]
    fn defaults_are_valid() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rejects_short_crypt_key() {
        let mut c = base();
        c.auth_crypt_key = "short".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn detects_shared_ports() {
        let mut c = base();
        assert!(!c.needs_port_mux());
        c.http_proxy_port = Some(c.bridge_port);
        assert!(c.needs_port_mux());
    }

    #[test]
    fn p2p_endpoint_prefers_public_ip() {
        let mut c = base();
        c.p2p_port = Some(6000);
        c.public_ip = Some("203.0.113.9".parse().unwrap());
        assert_eq!(c.p2p_endpoint().unwrap(), "203.0.113.9:6000");
    }
}
