//! Snappy compression decorator for tunneled flows.
//!
//! Each write becomes one `u32 length (LE) + snappy block` frame; the reader
//! reassembles frames and decompresses. Block-per-chunk keeps the stream
//! boundary-safe over the mux without buffering whole flows.

use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Largest uncompressed chunk carried in one frame.
const MAX_CHUNK: usize = 32 * 1024;

enum ReadState {
    Header,
    Body { needed: usize },
}

pub struct SnappyStream<S> {
    inner: S,
    encoder: snap::raw::Encoder,
    decoder: snap::raw::Decoder,
    // write side: encoded frame waiting to drain into `inner`
    pending_out: BytesMut,
    pending_claim: usize,
    // read side
    state: ReadState,
    in_buf: BytesMut,
    decoded: Bytes,
}

impl<S> SnappyStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            encoder: snap::raw::Encoder::new(),
            decoder: snap::raw::Decoder::new(),
            pending_out: BytesMut::new(),
            pending_claim: 0,
            state: ReadState::Header,
            in_buf: BytesMut::new(),
            decoded: Bytes::new(),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SnappyStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.decoded.is_empty() {
                let n = this.decoded.len().min(buf.remaining());
                buf.put_slice(&this.decoded.split_to(n));
                return Poll::Ready(Ok(()));
            }

            let needed = match this.state {
                ReadState::Header => 4,
                ReadState::Body { needed } => needed,
            };
            while this.in_buf.len() < needed {
                let mut chunk = [0u8; 16 * 1024];
                let mut rb = ReadBuf::new(&mut chunk);
                match Pin::new(&mut this.inner).poll_read(cx, &mut rb) {
                    Poll::Ready(Ok(())) => {
                        if rb.filled().is_empty() {
                            // clean EOF only between frames
                            if this.in_buf.is_empty() && matches!(this.state, ReadState::Header) {
                                return Poll::Ready(Ok(()));
                            }
                            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                        }
                        this.in_buf.extend_from_slice(rb.filled());
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }

            match this.state {
                ReadState::Header => {
                    let len = this.in_buf.get_u32_le() as usize;
                    if len == 0 || len > snap::raw::max_compress_len(MAX_CHUNK) {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "bad snappy frame length",
                        )));
                    }
                    this.state = ReadState::Body { needed: len };
                }
                ReadState::Body { needed } => {
                    let block = this.in_buf.split_to(needed);
                    let out = this
                        .decoder
                        .decompress_vec(&block)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    this.decoded = Bytes::from(out);
                    this.state = ReadState::Header;
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SnappyStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.pending_out.is_empty() {
            let take = buf.len().min(MAX_CHUNK);
            let block = this
                .encoder
                .compress_vec(&buf[..take])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            this.pending_out.extend_from_slice(&(block.len() as u32).to_le_bytes());
            this.pending_out.extend_from_slice(&block);
            this.pending_claim = take;
        }
        while !this.pending_out.is_empty() {
            match Pin::new(&mut this.inner).poll_write(cx, &this.pending_out) {
                Poll::Ready(Ok(n)) => {
                    this.pending_out.advance(n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(std::mem::take(&mut this.pending_claim)))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        while !this.pending_out.is_empty() {
            match Pin::new(&mut this.inner).poll_write(cx, &this.pending_out) {
                Poll::Ready(Ok(n)) => {
                    this.pending_out.advance(n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.as_mut().poll_flush(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn round_trips_small_payload() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let mut tx = SnappyStream::new(a);
        let mut rx = SnappyStream::new(b);

        tx.write_all(b"the quick brown fox").await.unwrap();
        tx.flush().await.unwrap();

        let mut buf = [0u8; 19];
        rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"the quick brown fox");
    }

    #[tokio::test]
    async fn round_trips_across_chunk_boundaries() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let mut tx = SnappyStream::new(a);
        let mut rx = SnappyStream::new(b);

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            tx.write_all(&payload).await.unwrap();
            tx.shutdown().await.unwrap();
        });

        let mut out = Vec::new();
        rx.read_to_end(&mut out).await.unwrap();
        writer.await.unwrap();
        assert_eq!(out, expected);
    }
}
