//! Public ingress fabric.
//!
//! Each tunnel mode gets a service here; all of them resolve the owning
//! records through the store, ask the bridge for a target stream, and join
//! the public socket to that stream with the shared relay. The port
//! multiplexer lets the bridge, HTTP, HTTPS and admin surfaces share one
//! TCP port; the rendezvous module is the UDP half of P2P brokering.

pub mod base;
pub mod cache;
pub mod http;
pub mod httputil;
pub mod https;
pub mod p2p;
pub mod pipe;
pub mod pmux;
pub mod sni;
pub mod socks5;
pub mod tcp;
pub mod udp;

pub use base::{ProxyBase, ProxyError};
pub use p2p::P2pRendezvous;
pub use pmux::{PortMux, SubListener};
