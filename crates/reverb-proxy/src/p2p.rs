//! UDP rendezvous for NAT hole punching.
//!
//! Three sockets on consecutive ports so each peer learns three external
//! mappings of the other (the clients use the spread to infer the NAT's
//! port-allocation interval). Packets are `password *#* role`; once both
//! roles registered under a password, each side receives the other's
//! literal `ip:port` and the entry is dropped.

use reverb_proto::consts::{CONN_DATA_SEQ, P2P_PROVIDER, P2P_VISITOR};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// How long a visitor waits for the provider slot to fill.
const PAIR_WAIT: Duration = Duration::from_secs(20);

#[derive(Default)]
struct Pairing {
    visitor: Option<SocketAddr>,
    provider: Option<SocketAddr>,
}

pub struct P2pRendezvous {
    base_port: u16,
    bind_ip: String,
    pairings: Arc<Mutex<HashMap<String, Pairing>>>,
}

impl P2pRendezvous {
    pub fn new(bind_ip: &str, base_port: u16) -> Self {
        Self {
            base_port,
            bind_ip: if bind_ip.is_empty() {
                "0.0.0.0".to_string()
            } else {
                bind_ip.to_string()
            },
            pairings: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Bind `port`, `port+1`, `port+2` and serve until dropped.
    pub async fn run(self) -> std::io::Result<()> {
        let mut tasks = Vec::new();
        for offset in 0..3u16 {
            let addr = format!("{}:{}", self.bind_ip, self.base_port + offset);
            let socket = Arc::new(UdpSocket::bind(&addr).await?);
            info!(%addr, "p2p rendezvous listening");
            let pairings = self.pairings.clone();
            tasks.push(tokio::spawn(serve_socket(socket, pairings)));
        }
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

async fn serve_socket(
    socket: Arc<UdpSocket>,
    pairings: Arc<Mutex<HashMap<String, Pairing>>>,
) {
    let mut buf = vec![0u8; 1024];
    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("p2p socket error: {}", e);
                break;
            }
        };
        let text = String::from_utf8_lossy(&buf[..n]).to_string();
        let socket = socket.clone();
        let pairings = pairings.clone();
        tokio::spawn(async move {
            handle_packet(socket, pairings, src, text).await;
        });
    }
}

async fn handle_packet(
    socket: Arc<UdpSocket>,
    pairings: Arc<Mutex<HashMap<String, Pairing>>>,
    src: SocketAddr,
    packet: String,
) {
    let mut parts = packet.splitn(2, CONN_DATA_SEQ);
    let (Some(password), Some(role)) = (parts.next(), parts.next()) else {
        return;
    };
    let password = password.to_string();
    debug!(%src, role, "p2p registration");

    match role {
        P2P_PROVIDER => {
            pairings
                .lock()
                .unwrap()
                .entry(password)
                .or_default()
                .provider = Some(src);
        }
        P2P_VISITOR => {
            pairings
                .lock()
                .unwrap()
                .entry(password.clone())
                .or_default()
                .visitor = Some(src);

            // wait for the provider, exchanging addresses once both exist
            let deadline = tokio::time::Instant::now() + PAIR_WAIT;
            loop {
                let provider = pairings
                    .lock()
                    .unwrap()
                    .get(&password)
                    .and_then(|p| p.provider);
                if let Some(provider) = provider {
                    let _ = socket.send_to(provider.to_string().as_bytes(), src).await;
                    let _ = socket.send_to(src.to_string().as_bytes(), provider).await;
                    pairings.lock().unwrap().remove(&password);
                    debug!(%src, %provider, "p2p pair exchanged");
                    return;
                }
                if tokio::time::Instant::now() >= deadline {
                    pairings.lock().unwrap().remove(&password);
                    return;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    async fn client() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn visitor_and_provider_learn_each_other() {
        let rendezvous = P2pRendezvous::new("127.0.0.1", 0);
        // bind a single test socket instead of the triple to keep the port
        // handling deterministic
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let server_addr = socket.local_addr().unwrap();
        tokio::spawn(serve_socket(socket, rendezvous.pairings.clone()));

        let visitor = client().await;
        let provider = client().await;
        let visitor_addr = visitor.local_addr().unwrap();
        let provider_addr = provider.local_addr().unwrap();

        provider
            .send_to(format!("pw{CONN_DATA_SEQ}provider").as_bytes(), server_addr)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        visitor
            .send_to(format!("pw{CONN_DATA_SEQ}visitor").as_bytes(), server_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), visitor.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&buf[..n]), provider_addr.to_string());

        let (n, _) = tokio::time::timeout(Duration::from_secs(5), provider.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&buf[..n]), visitor_addr.to_string());

        // the entry is gone after delivery
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rendezvous.pairings.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lone_visitor_times_out_and_is_removed() {
        let pairings: Arc<Mutex<HashMap<String, Pairing>>> = Arc::new(Mutex::new(HashMap::new()));
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let task = tokio::spawn(handle_packet(
            socket,
            pairings.clone(),
            "127.0.0.1:9999".parse().unwrap(),
            format!("pw{CONN_DATA_SEQ}visitor"),
        ));
        tokio::time::sleep(Duration::from_secs(25)).await;
        task.await.unwrap();
        assert!(pairings.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_packets_are_ignored() {
        let pairings: Arc<Mutex<HashMap<String, Pairing>>> = Arc::new(Mutex::new(HashMap::new()));
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        // no role separator: nothing may be registered
        handle_packet(
            socket,
            pairings.clone(),
            "127.0.0.1:9999".parse().unwrap(),
            "justapassword".to_string(),
        )
        .await;
        assert!(pairings.lock().unwrap().is_empty());
    }
}
