//! In-memory per-agent session state: the {signal, tunnel-mux, file-mux}
//! triple plus liveness bookkeeping. Never persisted.

use reverb_proto::{BoxedStream, FramedStream, Mux};
use std::sync::Arc;
use tokio::io::WriteHalf;
use tokio::task::JoinHandle;

/// Writable half of the signal connection. The read half lives inside the
/// health-ingest loop; P2P signaling and displacement close-tokens write
/// here, serialized by the mutex.
#[derive(Clone)]
pub struct SignalWriter {
    inner: Arc<tokio::sync::Mutex<FramedStream<WriteHalf<BoxedStream>>>>,
}

impl SignalWriter {
    pub fn new(half: WriteHalf<BoxedStream>) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(FramedStream::new(half))),
        }
    }

    pub async fn write_flag(&self, flag: [u8; 4]) -> Result<(), reverb_proto::FrameError> {
        self.inner.lock().await.write_flag(flag).await
    }

    pub async fn write_len_content(&self, buf: &[u8]) -> Result<(), reverb_proto::FrameError> {
        self.inner.lock().await.write_len_content(buf).await
    }
}

/// One connected agent as the bridge sees it.
#[derive(Default)]
pub struct AgentSession {
    pub signal: Option<SignalWriter>,
    pub tunnel: Option<Arc<Mux>>,
    pub file: Option<Arc<Mux>>,
    /// Display version the agent reported; admin-surface only.
    pub version: String,
    /// Consecutive heartbeat sweeps that found signal or tunnel missing.
    pub retries: u32,
    /// Health-ingest task for the signal connection, aborted on teardown.
    pub health_task: Option<JoinHandle<()>>,
}

impl AgentSession {
    pub fn teardown(&mut self) {
        if let Some(task) = self.health_task.take() {
            task.abort();
        }
        if let Some(mux) = self.tunnel.take() {
            mux.close();
        }
        if let Some(mux) = self.file.take() {
            mux.close();
        }
        self.signal = None;
    }
}
