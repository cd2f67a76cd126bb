//! Health ingest: the read side of every agent's signal connection.
//!
//! Agents stream `(target, status)` tuples; a failed probe removes the
//! target from every owned tunnel/host pool that references it, a recovery
//! puts it back. When the read loop ends the agent is torn down.

use crate::bridge::Bridge;
use reverb_proto::{BoxedStream, FramedStream};
use tokio::io::ReadHalf;
use tracing::{debug, info};

impl Bridge {
    pub(crate) async fn health_loop(
        &self,
        agent_id: i32,
        mut reader: FramedStream<ReadHalf<BoxedStream>>,
    ) {
        loop {
            match reader.read_health().await {
                Ok((target, healthy)) => {
                    debug!(agent_id, target = %target, healthy, "health report");
                    self.apply_health(agent_id, &target, healthy);
                }
                Err(_) => break,
            }
        }
        info!(agent_id, "signal connection closed");
        self.del_agent(agent_id).await;
    }

    /// Mutate the target pools of everything this agent owns. Applies
    /// atomically per entity under its pool lock; repeated reports for the
    /// same state are no-ops.
    pub fn apply_health(&self, agent_id: i32, target: &str, healthy: bool) {
        for tunnel in self.store.tunnels_for_agent(agent_id) {
            if tunnel.targets.contains_target(target) {
                if healthy {
                    tunnel.targets.mark_recovered(target);
                } else {
                    tunnel.targets.mark_failed(target);
                }
            }
        }
        for host in self.store.hosts_for_agent(agent_id) {
            if host.targets.contains_target(target) {
                if healthy {
                    host.targets.mark_recovered(target);
                } else {
                    host.targets.mark_failed(target);
                }
            }
        }
    }
}
