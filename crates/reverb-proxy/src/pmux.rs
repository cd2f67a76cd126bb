//! Port multiplexer: one TCP port serving bridge, HTTP, HTTPS and admin.
//!
//! Classification is a pure function of the first three bytes: an HTTP
//! method prefix routes by `Host:` header (admin host vs. vhost proxy), the
//! agent probe token routes to the bridge, anything else is treated as a
//! TLS ClientHello. Consumed bytes are replayed to the sub-listener.

use bytes::{Bytes, BytesMut};
use reverb_proto::consts::CONN_TEST;
use reverb_proto::{BoxedStream, PrefixedStream};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How long one connection may take to classify and hand off.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

const HTTP_PREFIXES: [&[u8; 3]; 8] = [
    b"GET", b"POS", b"HEA", b"PUT", b"DEL", b"CON", b"OPT", b"TRA",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Bridge,
    Http,
    Https,
    Admin,
}

/// Accept side of one protocol class.
pub struct SubListener {
    rx: mpsc::Receiver<(BoxedStream, SocketAddr)>,
}

impl SubListener {
    /// Next connection of this class, prefix bytes restored.
    pub async fn accept(&mut self) -> Option<(BoxedStream, SocketAddr)> {
        self.rx.recv().await
    }
}

pub struct PortMux {
    listener: TcpListener,
    admin_host: String,
    bridge_tx: mpsc::Sender<(BoxedStream, SocketAddr)>,
    http_tx: mpsc::Sender<(BoxedStream, SocketAddr)>,
    https_tx: mpsc::Sender<(BoxedStream, SocketAddr)>,
    admin_tx: mpsc::Sender<(BoxedStream, SocketAddr)>,
}

impl PortMux {
    /// Bind the shared port. `admin_host` is the hostname that routes HTTP
    /// connections to the admin surface instead of the vhost proxy.
    pub async fn bind(
        addr: &str,
        admin_host: &str,
    ) -> std::io::Result<(Self, SubListener, SubListener, SubListener, SubListener)> {
        let listener = TcpListener::bind(addr).await?;
        let (bridge_tx, bridge_rx) = mpsc::channel(16);
        let (http_tx, http_rx) = mpsc::channel(16);
        let (https_tx, https_rx) = mpsc::channel(16);
        let (admin_tx, admin_rx) = mpsc::channel(16);
        Ok((
            Self {
                listener,
                admin_host: admin_host.to_string(),
                bridge_tx,
                http_tx,
                https_tx,
                admin_tx,
            },
            SubListener { rx: bridge_rx },
            SubListener { rx: http_rx },
            SubListener { rx: https_rx },
            SubListener { rx: admin_rx },
        ))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop; one task per connection for the classification read.
    pub async fn run(self) {
        loop {
            let (conn, peer) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("port mux accept error: {}", e);
                    continue;
                }
            };
            let admin_host = self.admin_host.clone();
            let bridge_tx = self.bridge_tx.clone();
            let http_tx = self.http_tx.clone();
            let https_tx = self.https_tx.clone();
            let admin_tx = self.admin_tx.clone();
            tokio::spawn(async move {
                let classified =
                    tokio::time::timeout(ACCEPT_TIMEOUT, classify(conn, &admin_host)).await;
                let (class, prefix, conn) = match classified {
                    Ok(Ok(r)) => r,
                    Ok(Err(e)) => {
                        debug!(%peer, "port mux classification failed: {}", e);
                        return;
                    }
                    Err(_) => {
                        debug!(%peer, "port mux classification timed out");
                        return;
                    }
                };
                let stream: BoxedStream = Box::new(PrefixedStream::new(prefix, conn));
                let tx = match class {
                    Class::Bridge => &bridge_tx,
                    Class::Http => &http_tx,
                    Class::Https => &https_tx,
                    Class::Admin => &admin_tx,
                };
                let sent =
                    tokio::time::timeout(ACCEPT_TIMEOUT, tx.send((stream, peer))).await;
                if sent.is_err() {
                    debug!(%peer, "sub-listener did not take the connection in time");
                }
            });
        }
    }
}

async fn classify(
    conn: TcpStream,
    admin_host: &str,
) -> std::io::Result<(Class, Bytes, TcpStream)> {
    let mut conn = conn;
    let mut first = [0u8; 3];
    conn.read_exact(&mut first).await?;

    if &first == CONN_TEST {
        return Ok((Class::Bridge, Bytes::copy_from_slice(&first), conn));
    }
    if !HTTP_PREFIXES.contains(&&first) {
        return Ok((Class::Https, Bytes::copy_from_slice(&first), conn));
    }

    // HTTP-shaped: read header lines until Host or end of head, buffering
    // everything for replay
    let mut buffered = BytesMut::from(&first[..]);
    let mut reader = BufReader::new(conn);
    let mut host = None;
    loop {
        let mut line = Vec::new();
        read_line(&mut reader, &mut line).await?;
        buffered.extend_from_slice(&line);
        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some(value) = trimmed
            .strip_prefix("Host:")
            .or_else(|| trimmed.strip_prefix("host:"))
        {
            host = Some(value.trim().to_string());
            break;
        }
        if buffered.len() > 32 * 1024 {
            return Err(std::io::ErrorKind::InvalidData.into());
        }
    }

    // whatever BufReader consumed beyond the lines we inspected belongs to
    // the sub-listener too
    let pending = reader.buffer().to_vec();
    buffered.extend_from_slice(&pending);
    let conn = reader.into_inner();

    let class = match host {
        Some(h) => {
            let name = match h.rfind(':') {
                Some(idx) if h[idx + 1..].chars().all(|c| c.is_ascii_digit()) => {
                    h[..idx].to_string()
                }
                _ => h,
            };
            if !admin_host.is_empty() && name == admin_host {
                Class::Admin
            } else {
                Class::Http
            }
        }
        None => Class::Http,
    };
    Ok((class, buffered.freeze(), conn))
}

async fn read_line<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
) -> std::io::Result<()> {
    use tokio::io::AsyncBufReadExt;
    let n = reader.read_until(b'\n', out).await?;
    if n == 0 {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}
