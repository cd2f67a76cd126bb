//! Length-prefixed framed reader/writer for the control path.
//!
//! Every cross-process message between server and agent is `i32 length (LE)
//! + payload`, with 4-byte ASCII flag tokens in between. The same helpers
//! serve the bridge handshake, the config channel, and the descriptor write
//! on freshly opened mux streams.

use crate::consts::{CONN_DATA_SEQ, MAX_CONTENT_LEN};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("length {0} out of range (max {MAX_CONTENT_LEN})")]
    LengthOutOfRange(i64),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed health payload")]
    BadHealthPayload,
}

/// A framed view over any byte stream.
pub struct FramedStream<S> {
    inner: S,
}

impl<S> FramedStream<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read a raw LE i32 (the register work-type's hour count).
    pub async fn read_i32(&mut self) -> Result<i32, FrameError> {
        let mut b = [0u8; 4];
        self.inner.read_exact(&mut b).await?;
        Ok(i32::from_le_bytes(b))
    }

    /// Read the LE i32 length prefix, validated against [`MAX_CONTENT_LEN`].
    pub async fn read_len(&mut self) -> Result<usize, FrameError> {
        let mut b = [0u8; 4];
        self.inner.read_exact(&mut b).await?;
        let l = i32::from_le_bytes(b);
        if l < 0 || l as usize > MAX_CONTENT_LEN {
            return Err(FrameError::LengthOutOfRange(l as i64));
        }
        Ok(l as usize)
    }

    /// Read exactly `len` bytes of content.
    pub async fn read_exact_content(&mut self, len: usize) -> Result<Vec<u8>, FrameError> {
        if len > MAX_CONTENT_LEN {
            return Err(FrameError::LengthOutOfRange(len as i64));
        }
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Read a length prefix followed by that many bytes.
    pub async fn read_len_content(&mut self) -> Result<Vec<u8>, FrameError> {
        let len = self.read_len().await?;
        self.read_exact_content(len).await
    }

    /// Read the 4-byte flag token.
    pub async fn read_flag(&mut self) -> Result<[u8; 4], FrameError> {
        let mut b = [0u8; 4];
        self.inner.read_exact(&mut b).await?;
        Ok(b)
    }

    /// Read a length-prefixed JSON payload.
    pub async fn read_json<T: DeserializeOwned>(&mut self) -> Result<T, FrameError> {
        let body = self.read_len_content().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn read_bool(&mut self) -> Result<bool, FrameError> {
        let mut b = [0u8; 1];
        self.inner.read_exact(&mut b).await?;
        Ok(b[0] != 0)
    }

    /// Read one health report: `target *#* ("0"|"1")`, length-prefixed.
    pub async fn read_health(&mut self) -> Result<(String, bool), FrameError> {
        let body = self.read_len_content().await?;
        let text = String::from_utf8_lossy(&body);
        let mut parts = text.splitn(2, CONN_DATA_SEQ);
        match (parts.next(), parts.next()) {
            (Some(target), Some(status)) => Ok((target.to_string(), status == "1")),
            _ => Err(FrameError::BadHealthPayload),
        }
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    pub async fn write_flag(&mut self, flag: [u8; 4]) -> Result<(), FrameError> {
        self.inner.write_all(&flag).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Write `i32 length (LE) + content`.
    pub async fn write_len_content(&mut self, buf: &[u8]) -> Result<(), FrameError> {
        self.inner.write_all(&(buf.len() as i32).to_le_bytes()).await?;
        self.inner.write_all(buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Write raw bytes without a prefix (handshake digests, reply tokens).
    pub async fn write_raw(&mut self, buf: &[u8]) -> Result<(), FrameError> {
        self.inner.write_all(buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Serialize `v` to JSON and send it length-prefixed.
    pub async fn send_json<T: Serialize>(&mut self, v: &T) -> Result<(), FrameError> {
        let body = serde_json::to_vec(v)?;
        self.write_len_content(&body).await
    }

    /// One-byte boolean, as written after each config-channel operation.
    pub async fn write_bool(&mut self, v: bool) -> Result<(), FrameError> {
        self.inner.write_all(&[v as u8]).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Write one health report in the format [`read_health`] expects.
    pub async fn write_health(&mut self, target: &str, healthy: bool) -> Result<(), FrameError> {
        let body = format!("{target}{CONN_DATA_SEQ}{}", if healthy { "1" } else { "0" });
        self.write_len_content(body.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn len_content_round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = FramedStream::new(a);
        let mut rx = FramedStream::new(b);

        tx.write_len_content(b"hello").await.unwrap();
        assert_eq!(rx.read_len_content().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn rejects_oversized_length() {
        let (a, b) = tokio::io::duplex(4096);
        let mut rx = FramedStream::new(b);

        let mut raw = a;
        tokio::io::AsyncWriteExt::write_all(&mut raw, &(1_000_000i32).to_le_bytes())
            .await
            .unwrap();
        assert!(matches!(
            rx.read_len().await,
            Err(FrameError::LengthOutOfRange(_))
        ));
    }

    #[tokio::test]
    async fn rejects_negative_length() {
        let (a, b) = tokio::io::duplex(4096);
        let mut rx = FramedStream::new(b);

        let mut raw = a;
        tokio::io::AsyncWriteExt::write_all(&mut raw, &(-5i32).to_le_bytes())
            .await
            .unwrap();
        assert!(rx.read_len().await.is_err());
    }

    #[tokio::test]
    async fn health_tuple_round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = FramedStream::new(a);
        let mut rx = FramedStream::new(b);

        tx.write_health("10.0.0.1:22", false).await.unwrap();
        let (target, ok) = rx.read_health().await.unwrap();
        assert_eq!(target, "10.0.0.1:22");
        assert!(!ok);

        tx.write_health("10.0.0.1:22", true).await.unwrap();
        let (_, ok) = rx.read_health().await.unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn flags_round_trip() {
        let (a, b) = tokio::io::duplex(64);
        let mut tx = FramedStream::new(a);
        let mut rx = FramedStream::new(b);

        tx.write_flag(crate::consts::WORK_MAIN).await.unwrap();
        assert_eq!(rx.read_flag().await.unwrap(), crate::consts::WORK_MAIN);
    }
}
