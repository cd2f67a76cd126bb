//! Wire protocol primitives for the reverb bridge.
//!
//! Everything that crosses the control link between the server and an agent
//! goes through this crate: the length-prefixed framed connection, the 4-byte
//! work/flag tokens, the JSON link descriptor, the stream multiplexer that
//! carries tunneled flows over a single TCP connection, and the decorators
//! (TLS, snappy, token-bucket rate) that wrap individual flows.

pub mod consts;
pub mod crypt;
pub mod framed;
pub mod link;
pub mod mux;
pub mod prefixed;
pub mod rate;
pub mod snappy;
pub mod wrap;

pub use consts::*;
pub use framed::{FrameError, FramedStream};
pub use link::{Link, LinkOption};
pub use mux::{Mux, MuxError, MuxSide, MuxStream};
pub use prefixed::PrefixedStream;
pub use rate::RateLimiter;
pub use wrap::{wrap_stream, AsyncStream, BoxedStream};

/// Compute the 32-char lowercase hex md5 digest used throughout the wire
/// protocol (verify keys, version handshake, secret/p2p passwords).
pub fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_hex_is_32_lowercase_chars() {
        let d = md5_hex("0.9.0");
        assert_eq!(d.len(), 32);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
