//! Shared service base: admission gates and the common "open a link and
//! join the streams" path every mode runs through.

use crate::httputil::RequestHead;
use crate::pipe;
use bytes::Bytes;
use reverb_bridge::{Bridge, BridgeError};
use reverb_proto::{wrap_stream, BoxedStream, Link, PrefixedStream};
use reverb_store::{Agent, Flow, Store, StoreError, Tunnel, TunnelMode};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent is disabled")]
    AgentDisabled,

    #[error("traffic exceeded")]
    FlowExceeded,

    #[error("connections exceed the current agent limit")]
    TooManyConnections,

    #[error("401 unauthorized")]
    Unauthorized,

    #[error("all targets are offline")]
    NoTarget,

    #[error("malformed request")]
    BadRequest,
}

/// Connection slot held for the lifetime of one public flow.
pub struct ConnGuard {
    agent: Arc<Agent>,
}

impl std::fmt::Debug for ConnGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnGuard")
            .field("agent_id", &self.agent.id)
            .finish()
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.agent.release_conn();
    }
}

/// State shared by every proxy service.
#[derive(Clone)]
pub struct ProxyBase {
    pub store: Arc<Store>,
    pub bridge: Arc<Bridge>,
    /// Returned to HTTP clients when the upstream dial fails.
    pub error_content: Bytes,
}

impl ProxyBase {
    pub fn new(store: Arc<Store>, bridge: Arc<Bridge>, error_content: Bytes) -> Self {
        Self {
            store,
            bridge,
            error_content,
        }
    }

    /// Admission gate run before any byte is forwarded: agent enabled, flow
    /// quota intact, connection slot available. The returned guard releases
    /// the slot on drop.
    pub fn admit(&self, agent: &Arc<Agent>) -> Result<ConnGuard, ProxyError> {
        if !agent.enabled() {
            return Err(ProxyError::AgentDisabled);
        }
        if agent.over_flow_limit() {
            return Err(ProxyError::FlowExceeded);
        }
        if !agent.try_acquire_conn() {
            return Err(ProxyError::TooManyConnections);
        }
        Ok(ConnGuard {
            agent: agent.clone(),
        })
    }

    /// Basic-auth check for HTTP-shaped flows. Only enforced when the agent
    /// has credentials configured.
    pub fn check_basic_auth(&self, head: &RequestHead, agent: &Arc<Agent>) -> Result<(), ProxyError> {
        let profile = agent.profile();
        if profile.auth_user.is_empty() || profile.auth_password.is_empty() {
            return Ok(());
        }
        if head.basic_auth_matches(&profile.auth_user, &profile.auth_password) {
            Ok(())
        } else {
            Err(ProxyError::Unauthorized)
        }
    }

    /// Open the agent-side stream for one flow and join it with the public
    /// socket. `prior_bytes` (sniffed prefixes like a ClientHello) are
    /// written upstream first.
    #[allow(clippy::too_many_arguments)]
    pub async fn deal_client(
        &self,
        public: BoxedStream,
        agent: &Arc<Agent>,
        tunnel: &Arc<Tunnel>,
        target_addr: &str,
        prior_bytes: Option<Bytes>,
        conn_type: &str,
        remote_addr: &str,
    ) -> Result<(), ProxyError> {
        let profile = agent.profile();
        let link = Link::new(
            conn_type,
            target_addr,
            profile.crypt,
            profile.compress,
            remote_addr,
            tunnel.targets.local_proxy,
        );
        let flow = tunnel.flow.clone();
        self.join_link(public, agent, link, Some(tunnel.mode), flow, prior_bytes)
            .await
    }

    /// The second half of `deal_client`, shared with the vhost services
    /// that carry their own flow handle.
    pub async fn join_link(
        &self,
        public: BoxedStream,
        agent: &Arc<Agent>,
        link: Link,
        mode: Option<TunnelMode>,
        flow: Arc<Flow>,
        prior_bytes: Option<Bytes>,
    ) -> Result<(), ProxyError> {
        let crypt = link.crypt;
        let compress = link.compress;
        let target = match self.bridge.send_link_info(agent.id, link, mode).await {
            Ok(t) => t,
            Err(e) => {
                warn!(agent_id = agent.id, "could not reach agent: {}", e);
                return Err(e.into());
            }
        };

        let mut target = wrap_stream(target, crypt, compress, Some(agent.rate()), true).await?;
        if let Some(rb) = prior_bytes {
            use tokio::io::AsyncWriteExt;
            target.write_all(&rb).await?;
        }

        let (inlet, export) = pipe::relay(public, target, Some(flow)).await;
        agent.flow.add(inlet as i64, export as i64);
        debug!(agent_id = agent.id, inlet, export, "flow finished");
        Ok(())
    }
}

/// Restore sniffed bytes in front of a stream and box the result.
pub fn replay(prefix: Bytes, stream: BoxedStream) -> BoxedStream {
    Box::new(PrefixedStream::new(prefix, stream))
}
