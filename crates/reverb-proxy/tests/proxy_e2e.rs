//! End-to-end proxy tests: real listeners, a scripted agent behind a real
//! bridge handshake, and public clients driving each ingress mode.

use reverb_bridge::{Bridge, BridgeConfig};
use reverb_proto::{consts, md5_hex, BoxedStream, FramedStream, Link, Mux, MuxSide};
use reverb_proxy::base::ProxyBase;
use reverb_proxy::cache::HttpCache;
use reverb_proxy::http::HttpVhostServer;
use reverb_proxy::socks5::Socks5Server;
use reverb_proxy::tcp::TcpTunnelServer;
use reverb_store::{AgentProfile, Host, HostScheme, Store, Tunnel, TunnelMode};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const VKEY: &str = "cccccccccccccccc";

struct Rig {
    store: Arc<Store>,
    bridge: Arc<Bridge>,
    base: ProxyBase,
    agent_id: i32,
    /// Streams the scripted agent has accepted.
    streams_opened: Arc<AtomicUsize>,
}

/// Boot a bridge listener, run the real agent handshake for CHAN, and start
/// a scripted agent that dials whatever the link descriptor names.
async fn rig() -> Rig {
    let store = Arc::new(Store::new());
    let agent = store
        .create_agent(VKEY.into(), AgentProfile::default())
        .unwrap();
    let (bridge, _events) = Bridge::new(store.clone(), BridgeConfig::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_bridge = bridge.clone();
    tokio::spawn(async move {
        loop {
            let Ok((conn, peer)) = listener.accept().await else {
                break;
            };
            let bridge = accept_bridge.clone();
            tokio::spawn(async move {
                bridge.handle_conn(Box::new(conn), peer).await;
            });
        }
    });

    // agent side of the handshake, CHAN work type
    let conn = TcpStream::connect(addr).await.unwrap();
    let mut framed = FramedStream::new(conn);
    framed.write_raw(consts::CONN_TEST).await.unwrap();
    framed
        .write_len_content(consts::CORE_VERSION.as_bytes())
        .await
        .unwrap();
    framed.write_len_content(b"rig-agent").await.unwrap();
    framed.read_exact_content(32).await.unwrap();
    framed.write_raw(md5_hex(VKEY).as_bytes()).await.unwrap();
    assert_eq!(framed.read_flag().await.unwrap(), consts::VERIFY_SUCCESS);
    framed.write_flag(consts::WORK_CHAN).await.unwrap();

    let agent_mux = Arc::new(Mux::new(
        framed.into_inner(),
        MuxSide::Client,
        Duration::from_secs(60),
    ));
    let streams_opened = Arc::new(AtomicUsize::new(0));

    // scripted agent: accept streams, dial the described target, relay
    let counter = streams_opened.clone();
    tokio::spawn(async move {
        while let Some(stream) = agent_mux.accept_stream().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut framed = FramedStream::new(stream);
                let Ok(link) = framed.read_json::<Link>().await else {
                    return;
                };
                let Ok(local) = TcpStream::connect(&link.host).await else {
                    return;
                };
                let stream = framed.into_inner();
                let _ = reverb_proxy::pipe::relay(
                    Box::new(stream) as BoxedStream,
                    Box::new(local) as BoxedStream,
                    None,
                )
                .await;
            });
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let base = ProxyBase::new(
        store.clone(),
        bridge.clone(),
        bytes::Bytes::from_static(b"no service"),
    );
    Rig {
        store,
        bridge,
        base,
        agent_id: agent.id,
        streams_opened,
    }
}

/// An upstream echo server standing in for the service inside the agent's
/// network.
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn tcp_tunnel_conserves_bytes_both_ways() {
    let rig = rig().await;
    let upstream = echo_server().await;

    let port = free_port();
    let tunnel = rig
        .store
        .create_tunnel(Tunnel::new(
            rig.store.alloc_tunnel_id(),
            rig.agent_id,
            TunnelMode::Tcp,
            port,
            "127.0.0.1",
            &upstream.to_string(),
            false,
        ))
        .unwrap();
    tokio::spawn(TcpTunnelServer::new(rig.base.clone(), tunnel.clone()).run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    client.write_all(&payload).await.unwrap();

    let mut back = vec![0u8; payload.len()];
    client.read_exact(&mut back).await.unwrap();
    assert_eq!(back, payload);

    client.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(tunnel.flow.inlet(), payload.len() as i64);
    assert_eq!(tunnel.flow.export(), payload.len() as i64);
}

/// An upstream HTTP server answering every request with a small fixed body.
async fn http_upstream(hits: Arc<AtomicUsize>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            let hits = hits.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    // one request head per loop; echo a fixed body
                    let mut total = Vec::new();
                    loop {
                        let n = match conn.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        total.extend_from_slice(&buf[..n]);
                        if total.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    hits.fetch_add(1, Ordering::SeqCst);
                    let body = b"static-bytes";
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                        body.len()
                    );
                    if conn.write_all(head.as_bytes()).await.is_err() {
                        return;
                    }
                    if conn.write_all(body).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn vhost_routes_requests_and_serves_cache_hits() {
    let rig = rig().await;
    let upstream_hits = Arc::new(AtomicUsize::new(0));
    let upstream = http_upstream(upstream_hits.clone()).await;

    rig.store
        .create_host(Host::new(
            rig.store.alloc_host_id(),
            rig.agent_id,
            "t.example",
            "/",
            HostScheme::All,
            &upstream.to_string(),
        ))
        .unwrap();

    let cache = Arc::new(HttpCache::new(16));
    let vhost = Arc::new(HttpVhostServer::new(
        rig.base.clone(),
        false,
        Some(cache.clone()),
    ));

    let request = b"GET /img.png HTTP/1.1\r\nHost: t.example\r\n\r\n";
    let mut responses = Vec::new();
    for _ in 0..2 {
        let (public, mut client) = tokio::io::duplex(64 * 1024);
        let vhost = vhost.clone();
        let handler = tokio::spawn(async move {
            vhost
                .handle_connection(
                    Box::new(public),
                    "127.0.0.1:5555".parse().unwrap(),
                    "http",
                )
                .await;
        });
        client.write_all(request).await.unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        // read until the fixed body shows up
        while !out.windows(12).any(|w| w == b"static-bytes") {
            let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        responses.push(out);
        drop(client);
        let _ = handler.await;
    }

    assert!(responses[0].windows(12).any(|w| w == b"static-bytes"));
    assert_eq!(responses[0], responses[1], "cache hit must be byte-identical");
    // the second GET was served from cache: one upstream request only
    assert_eq!(upstream_hits.load(Ordering::SeqCst), 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn socks5_multi_account_auth_gates_connect() {
    let rig = rig().await;
    let upstream = echo_server().await;

    let mut tunnel = Tunnel::new(
        rig.store.alloc_tunnel_id(),
        rig.agent_id,
        TunnelMode::Socks5,
        0,
        "127.0.0.1",
        "",
        false,
    );
    tunnel.multi_accounts = Some(HashMap::from([("a".to_string(), "b".to_string())]));
    let tunnel = rig.store.create_tunnel(tunnel).unwrap();
    let server = Socks5Server::new(rig.base.clone(), tunnel, None);

    // wrong password: method negotiation succeeds, auth fails with 0x01
    let (public, mut client) = tokio::io::duplex(4096);
    let peer: SocketAddr = "127.0.0.1:7001".parse().unwrap();
    let task = tokio::spawn(async move {
        let _ = server.handle_conn(Box::new(public), peer, None).await;
    });
    client.write_all(&[5, 1, 2]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [5, 2]);
    client.write_all(&[1, 1, b'a', 5, b'w', b'r', b'o', b'n', b'g']).await.unwrap();
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [1, 1]);
    task.await.unwrap();

    // correct credentials reach CONNECT and the echo upstream
    let tunnel = rig.store.get_tunnel(1).unwrap();
    let server = Socks5Server::new(rig.base.clone(), tunnel, None);
    let (public, mut client) = tokio::io::duplex(4096);
    let task = tokio::spawn(async move {
        let _ = server.handle_conn(Box::new(public), peer, None).await;
    });
    client.write_all(&[5, 1, 2]).await.unwrap();
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [5, 2]);
    client.write_all(&[1, 1, b'a', 1, b'b']).await.unwrap();
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [1, 0]);

    // CONNECT to the upstream echo address
    let mut req = vec![5, 1, 0, 1];
    let SocketAddr::V4(v4) = upstream else {
        panic!("expected v4")
    };
    req.extend_from_slice(&v4.ip().octets());
    req.extend_from_slice(&v4.port().to_be_bytes());
    client.write_all(&req).await.unwrap();

    let mut connect_reply = [0u8; 10];
    client.read_exact(&mut connect_reply).await.unwrap();
    assert_eq!(connect_reply[1], 0, "connect must succeed");

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    drop(client);
    let _ = task.await;

    assert!(rig.streams_opened.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn disabled_agent_is_refused_before_any_byte() {
    let rig = rig().await;
    let agent = rig.store.get_agent(rig.agent_id).unwrap();
    let mut profile = agent.profile();
    profile.enabled = false;
    agent.set_profile(profile);

    let err = rig.base.admit(&agent).unwrap_err();
    assert!(matches!(err, reverb_proxy::ProxyError::AgentDisabled));
    assert_eq!(rig.bridge.online_count(), 0);
}
