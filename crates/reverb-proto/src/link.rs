//! The link descriptor sent server→agent on each freshly opened mux stream.
//!
//! The JSON tells the agent how to dial the inner target and how the stream
//! is framed on the wire (crypt/compress mirror what the server applies on
//! its side).

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Link {
    /// How the agent should dial: `tcp`, `udp`, `http` or `udp5`.
    pub conn_type: String,
    /// Target `ip:port` the agent (or the server, for local-proxy links)
    /// connects to.
    pub host: String,
    pub crypt: bool,
    pub compress: bool,
    /// When set, the server dials the target itself instead of handing the
    /// flow to the agent.
    pub local_proxy: bool,
    /// Address of the public client that triggered this link.
    pub remote_addr: String,
    #[serde(rename = "Option")]
    pub option: LinkOption,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct LinkOption {
    /// Dial timeout in nanoseconds, matching the wire format agents expect.
    pub timeout: i64,
}

impl Link {
    pub fn new(
        conn_type: &str,
        host: &str,
        crypt: bool,
        compress: bool,
        remote_addr: &str,
        local_proxy: bool,
    ) -> Self {
        Self {
            conn_type: conn_type.to_string(),
            host: host.to_string(),
            crypt,
            compress,
            local_proxy,
            remote_addr: remote_addr.to_string(),
            option: LinkOption {
                timeout: DEFAULT_DIAL_TIMEOUT.as_nanos() as i64,
            },
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        if self.option.timeout <= 0 {
            DEFAULT_DIAL_TIMEOUT
        } else {
            Duration::from_nanos(self.option.timeout as u64)
        }
    }
}
