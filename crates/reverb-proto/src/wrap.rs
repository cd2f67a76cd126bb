//! Decorator chain applied to each tunneled flow.
//!
//! Mirrors what the agent applies on its end of the mux stream: `crypt`
//! wraps the flow in TLS, otherwise `compress` wraps it in snappy, and the
//! per-agent rate limiter is always the outermost layer.

use crate::rate::{RateLimiter, RateStream};
use crate::snappy::SnappyStream;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Object-safe alias for anything the proxy fabric can copy bytes through.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Wrap `stream` for one flow. `server_side` selects which end of the TLS
/// handshake this is.
pub async fn wrap_stream(
    stream: BoxedStream,
    crypt: bool,
    compress: bool,
    rate: Option<Arc<RateLimiter>>,
    server_side: bool,
) -> io::Result<BoxedStream> {
    if crypt {
        if server_side {
            let tls = crate::crypt::tls_server(stream).await?;
            return Ok(Box::new(RateStream::new(tls, rate)));
        }
        let tls = crate::crypt::tls_client(stream).await?;
        return Ok(Box::new(RateStream::new(tls, rate)));
    }
    if compress {
        return Ok(Box::new(RateStream::new(SnappyStream::new(stream), rate)));
    }
    Ok(Box::new(RateStream::new(stream, rate)))
}
