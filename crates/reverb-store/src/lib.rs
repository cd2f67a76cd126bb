//! In-memory catalog of everything the server proxies for.
//!
//! The repository owns the Agent, Tunnel and Host records; every other
//! component holds `Arc`s handed out from here and resolves ownership by id
//! rather than back-pointers. Nothing in this crate touches the network.

pub mod entities;
pub mod pool;
pub mod ports;
pub mod store;

pub use entities::{
    Agent, AgentProfile, Flow, HealthConfig, Host, HostScheme, Tunnel, TunnelMode,
};
pub use pool::TargetPool;
pub use ports::expand_ports;
pub use store::{ip_of, ListQuery, Store, StoreError};
