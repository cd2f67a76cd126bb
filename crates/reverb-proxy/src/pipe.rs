//! Bidirectional byte relay between a public socket and a tunneled stream.
//!
//! Two tasks, one per direction; whichever direction closes first unblocks
//! the other so neither side lingers. Flow counters are bumped per copied
//! chunk: client→target counts as inlet, target→client as export.

use reverb_proto::BoxedStream;
use reverb_store::Flow;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;

const COPY_BUF: usize = 32 * 1024;

/// Copy until either side closes. Returns (inlet, export) byte totals.
pub async fn relay(client: BoxedStream, target: BoxedStream, flow: Option<Arc<Flow>>) -> (u64, u64) {
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut target_r, mut target_w) = tokio::io::split(target);
    let done = Arc::new(Notify::new());

    let inlet_flow = flow.clone();
    let inlet_done = done.clone();
    let inlet = tokio::spawn(async move {
        let mut buf = vec![0u8; COPY_BUF];
        let mut total = 0u64;
        loop {
            let n = tokio::select! {
                r = client_r.read(&mut buf) => match r {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                },
                _ = inlet_done.notified() => break,
            };
            if target_w.write_all(&buf[..n]).await.is_err() {
                break;
            }
            if let Some(f) = &inlet_flow {
                f.add(n as i64, 0);
            }
            total += n as u64;
        }
        inlet_done.notify_waiters();
        let _ = target_w.shutdown().await;
        total
    });

    let export_done = done.clone();
    let export = tokio::spawn(async move {
        let mut buf = vec![0u8; COPY_BUF];
        let mut total = 0u64;
        loop {
            let n = tokio::select! {
                r = target_r.read(&mut buf) => match r {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                },
                _ = export_done.notified() => break,
            };
            if client_w.write_all(&buf[..n]).await.is_err() {
                break;
            }
            if let Some(f) = &flow {
                f.add(0, n as i64);
            }
            total += n as u64;
        }
        export_done.notify_waiters();
        let _ = client_w.shutdown().await;
        total
    });

    let (inlet, export) = tokio::join!(inlet, export);
    (inlet.unwrap_or(0), export.unwrap_or(0))
}
