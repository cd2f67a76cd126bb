//! Stream multiplexer: many logical flows over one reliable carrier.
//!
//! One TCP connection from an agent carries every tunneled flow for that
//! agent. Each flow is a [`MuxStream`] implementing `AsyncRead + AsyncWrite`
//! so the decorator chain and copy loops treat it like any socket. Frames
//! are `stream_id u32 | type u8 | flags u8 | len u32` (big-endian header),
//! with per-stream credit windows for flow control. The frame format never
//! leaves this project; both ends of the carrier are ours.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Largest data frame payload. Bigger writes are split.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Per-stream send window; replenished by WindowUpdate frames from the peer.
pub const INITIAL_WINDOW: i64 = 256 * 1024;

const HEADER_SIZE: usize = 10;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("multiplexer closed")]
    Closed,

    #[error("invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameType {
    New = 0,
    Data = 1,
    Close = 2,
    WindowUpdate = 3,
    Ping = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(v: u8) -> Result<Self, MuxError> {
        match v {
            0 => Ok(FrameType::New),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            3 => Ok(FrameType::WindowUpdate),
            4 => Ok(FrameType::Ping),
            other => Err(MuxError::InvalidFrameType(other)),
        }
    }
}

#[derive(Debug)]
struct Frame {
    stream_id: u32,
    frame_type: FrameType,
    payload: Bytes,
}

impl Frame {
    fn new(stream_id: u32, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            payload,
        }
    }

    fn window_update(stream_id: u32, credit: u32) -> Self {
        let mut b = BytesMut::with_capacity(4);
        b.put_u32(credit);
        Self::new(stream_id, FrameType::WindowUpdate, b.freeze())
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(0); // flags, reserved
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.clone());
        buf.freeze()
    }
}

/// Which end of the carrier this mux sits on; determines stream id parity so
/// both sides can open streams without collisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxSide {
    Server,
    Client,
}

struct WriteState {
    credit: AtomicI64,
    waker: Mutex<Option<Waker>>,
    peer_closed: AtomicBool,
}

impl WriteState {
    fn new() -> Self {
        Self {
            credit: AtomicI64::new(INITIAL_WINDOW),
            waker: Mutex::new(None),
            peer_closed: AtomicBool::new(false),
        }
    }

    fn add_credit(&self, n: i64) {
        self.credit.fetch_add(n, Ordering::AcqRel);
        if let Some(w) = self.waker.lock().unwrap().take() {
            w.wake();
        }
    }

    fn mark_peer_closed(&self) {
        self.peer_closed.store(true, Ordering::Release);
        if let Some(w) = self.waker.lock().unwrap().take() {
            w.wake();
        }
    }
}

struct StreamEntry {
    data_tx: mpsc::UnboundedSender<Bytes>,
    write: Arc<WriteState>,
}

struct Shared {
    out_tx: mpsc::UnboundedSender<Frame>,
    streams: Mutex<HashMap<u32, StreamEntry>>,
    closed: AtomicBool,
}

impl Shared {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut streams = self.streams.lock().unwrap();
        for (_, entry) in streams.drain() {
            entry.write.mark_peer_closed();
            // dropping data_tx signals EOF to the read side
        }
    }
}

/// The multiplexer over one carrier. Open/accept streams and watch
/// `is_closed` to learn when the carrier died.
pub struct Mux {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MuxStream>>,
    next_id: AtomicU32,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Mux {
    /// Take ownership of a carrier and start the frame pump. `idle_timeout`
    /// is how long the carrier may stay silent (our own pings count) before
    /// the mux declares it dead.
    pub fn new<S>(carrier: S, side: MuxSide, idle_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(carrier);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            out_tx,
            streams: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let reader = tokio::spawn(read_loop(
            read_half,
            shared.clone(),
            accept_tx,
            idle_timeout,
        ));
        let writer = tokio::spawn(write_loop(write_half, shared.clone(), out_rx, idle_timeout));

        Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            next_id: AtomicU32::new(match side {
                MuxSide::Server => 1,
                MuxSide::Client => 2,
            }),
            reader,
            writer,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Open a new outgoing stream.
    pub fn open_stream(&self) -> Result<MuxStream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::Closed);
        }
        let id = self.next_id.fetch_add(2, Ordering::SeqCst);
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let write = Arc::new(WriteState::new());
        self.shared
            .streams
            .lock()
            .unwrap()
            .insert(id, StreamEntry { data_tx, write: write.clone() });
        self.shared
            .out_tx
            .send(Frame::new(id, FrameType::New, Bytes::new()))
            .map_err(|_| MuxError::Closed)?;
        trace!(stream_id = id, "opened mux stream");
        Ok(MuxStream {
            id,
            shared: self.shared.clone(),
            write,
            data_rx,
            read_buf: Bytes::new(),
            sent_close: false,
        })
    }

    /// Wait for the peer to open a stream. Returns `None` once the mux is
    /// closed.
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Tear the carrier down and fail every live stream.
    pub fn close(&self) {
        self.shared.close();
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop<R>(
    mut read_half: R,
    shared: Arc<Shared>,
    accept_tx: mpsc::UnboundedSender<MuxStream>,
    idle_timeout: Duration,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    loop {
        let mut header = [0u8; HEADER_SIZE];
        let read = tokio::time::timeout(idle_timeout, read_half.read_exact(&mut header)).await;
        match read {
            Err(_) => {
                debug!("mux carrier idle for {:?}, disconnecting", idle_timeout);
                break;
            }
            Ok(Err(e)) => {
                debug!("mux carrier read ended: {}", e);
                break;
            }
            Ok(Ok(_)) => {}
        }

        let mut hdr = &header[..];
        let stream_id = hdr.get_u32();
        let raw_type = hdr.get_u8();
        let _flags = hdr.get_u8();
        let len = hdr.get_u32() as usize;
        if len > MAX_FRAME_PAYLOAD {
            warn!(len, "oversized mux frame, disconnecting");
            break;
        }
        let mut payload = vec![0u8; len];
        if len > 0 {
            if let Err(e) = read_half.read_exact(&mut payload).await {
                debug!("mux carrier read ended: {}", e);
                break;
            }
        }
        let frame_type = match FrameType::try_from(raw_type) {
            Ok(t) => t,
            Err(e) => {
                warn!("bad mux frame: {}", e);
                break;
            }
        };

        match frame_type {
            FrameType::New => {
                let (data_tx, data_rx) = mpsc::unbounded_channel();
                let write = Arc::new(WriteState::new());
                shared
                    .streams
                    .lock()
                    .unwrap()
                    .insert(stream_id, StreamEntry { data_tx, write: write.clone() });
                let stream = MuxStream {
                    id: stream_id,
                    shared: shared.clone(),
                    write,
                    data_rx,
                    read_buf: Bytes::new(),
                    sent_close: false,
                };
                if accept_tx.send(stream).is_err() {
                    break;
                }
            }
            FrameType::Data => {
                let streams = shared.streams.lock().unwrap();
                if let Some(entry) = streams.get(&stream_id) {
                    let _ = entry.data_tx.send(Bytes::from(payload));
                } else {
                    trace!(stream_id, "data for unknown stream dropped");
                }
            }
            FrameType::WindowUpdate => {
                if payload.len() == 4 {
                    let credit = u32::from_be_bytes(payload[..4].try_into().unwrap());
                    let streams = shared.streams.lock().unwrap();
                    if let Some(entry) = streams.get(&stream_id) {
                        entry.write.add_credit(credit as i64);
                    }
                }
            }
            FrameType::Close => {
                let entry = shared.streams.lock().unwrap().remove(&stream_id);
                if let Some(entry) = entry {
                    entry.write.mark_peer_closed();
                }
            }
            FrameType::Ping => {
                // nothing to do; arrival already reset the idle timer
            }
        }
    }
    shared.close();
}

async fn write_loop<W>(
    mut write_half: W,
    shared: Arc<Shared>,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    idle_timeout: Duration,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let ping_every = idle_timeout / 3;
    let mut ping = tokio::time::interval(ping_every.max(Duration::from_secs(1)));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        let frame = tokio::select! {
            f = out_rx.recv() => match f {
                Some(f) => f,
                None => break,
            },
            _ = ping.tick() => Frame::new(0, FrameType::Ping, Bytes::new()),
        };
        if let Err(e) = write_half.write_all(&frame.encode()).await {
            debug!("mux carrier write ended: {}", e);
            break;
        }
        if let Err(e) = write_half.flush().await {
            debug!("mux carrier flush ended: {}", e);
            break;
        }
    }
    shared.close();
}

/// One logical flow over the carrier.
pub struct MuxStream {
    id: u32,
    shared: Arc<Shared>,
    write: Arc<WriteState>,
    data_rx: mpsc::UnboundedReceiver<Bytes>,
    read_buf: Bytes,
    sent_close: bool,
}

impl MuxStream {
    pub fn stream_id(&self) -> u32 {
        self.id
    }

    fn send_close(&mut self) {
        if !self.sent_close {
            self.sent_close = true;
            let _ = self
                .shared
                .out_tx
                .send(Frame::new(self.id, FrameType::Close, Bytes::new()));
            self.shared.streams.lock().unwrap().remove(&self.id);
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let n = self.read_buf.len().min(buf.remaining());
                buf.put_slice(&self.read_buf.split_to(n));
                // replenish the peer's send window for what we consumed
                let _ = self
                    .shared
                    .out_tx
                    .send(Frame::window_update(self.id, n as u32));
                return Poll::Ready(Ok(()));
            }
            match self.data_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    self.read_buf = chunk;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())), // EOF
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        loop {
            if self.shared.closed.load(Ordering::Acquire)
                || self.write.peer_closed.load(Ordering::Acquire)
            {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            let avail = self.write.credit.load(Ordering::Acquire);
            if avail <= 0 {
                *self.write.waker.lock().unwrap() = Some(cx.waker().clone());
                // re-check after parking the waker to close the race with a
                // WindowUpdate landing in between
                if self.write.credit.load(Ordering::Acquire) > 0 {
                    continue;
                }
                return Poll::Pending;
            }
            let n = buf.len().min(avail as usize).min(MAX_FRAME_PAYLOAD);
            self.write.credit.fetch_sub(n as i64, Ordering::AcqRel);
            let frame = Frame::new(self.id, FrameType::Data, Bytes::copy_from_slice(&buf[..n]));
            if self.shared.out_tx.send(frame).is_err() {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            return Poll::Ready(Ok(n));
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.send_close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.send_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (Mux, Mux) {
        let (a, b) = tokio::io::duplex(1 << 20);
        (
            Mux::new(a, MuxSide::Server, Duration::from_secs(60)),
            Mux::new(b, MuxSide::Client, Duration::from_secs(60)),
        )
    }

    #[tokio::test]
    async fn open_accept_and_echo() {
        let (server, client) = pair();

        let mut s = server.open_stream().unwrap();
        let mut c = client.accept_stream().await.unwrap();

        s.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        c.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        c.write_all(b"pong").await.unwrap();
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn many_concurrent_streams_stay_isolated() {
        let (server, client) = pair();
        let client = Arc::new(client);

        let echo_client = client.clone();
        tokio::spawn(async move {
            while let Some(mut stream) = echo_client.accept_stream().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8];
                    if stream.read_exact(&mut buf).await.is_ok() {
                        let _ = stream.write_all(&buf).await;
                    }
                });
            }
        });

        let mut handles = Vec::new();
        for i in 0u64..32 {
            let mut s = server.open_stream().unwrap();
            handles.push(tokio::spawn(async move {
                let msg = i.to_be_bytes();
                s.write_all(&msg).await.unwrap();
                let mut buf = [0u8; 8];
                s.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf, msg);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn writer_blocks_on_window_and_resumes() {
        let (server, client) = pair();

        let mut s = server.open_stream().unwrap();
        let mut c = client.accept_stream().await.unwrap();

        let payload = vec![7u8; INITIAL_WINDOW as usize + 1024];
        let writer = tokio::spawn(async move {
            s.write_all(&payload).await.unwrap();
            s
        });

        // the writer cannot finish until the reader consumes some credit
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        let mut total = 0usize;
        let mut buf = vec![0u8; 16 * 1024];
        while total < INITIAL_WINDOW as usize + 1024 {
            let n = c.read(&mut buf).await.unwrap();
            assert!(n > 0);
            total += n;
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn close_surfaces_to_streams_and_mux() {
        let (server, client) = pair();
        let mut s = server.open_stream().unwrap();
        let _c = client.accept_stream().await.unwrap();

        client.close();
        // reading the dead carrier ends with EOF on the server side
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), s.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(client.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_carrier_disconnects() {
        // a raw duplex with no peer mux: nothing ever arrives, so the idle
        // timer must fire
        let (a, _b) = tokio::io::duplex(4096);
        let mux = Mux::new(a, MuxSide::Server, Duration::from_secs(3));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(mux.is_closed());
    }
}
