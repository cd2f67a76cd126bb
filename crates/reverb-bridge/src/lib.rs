//! The bridge: server-side session layer for connected agents.
//!
//! Every agent keeps one outbound control connection per concern (signal,
//! tunnel mux, file mux); the bridge authenticates them, wires the triple
//! into an [`session::AgentSession`], ingests health reports off the signal
//! connection, brokers new tunneled streams for the proxy fabric and sweeps
//! dead sessions every five seconds.

pub mod bridge;
pub mod config;
pub mod health;
pub mod prober;
pub mod session;

pub use bridge::{Bridge, BridgeConfig, BridgeError, BridgeEvent};
pub use config::test_port_open;
pub use prober::{HealthCheck, HealthReporter, HealthScheduler};
pub use session::AgentSession;
