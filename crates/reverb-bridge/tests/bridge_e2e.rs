//! End-to-end bridge tests: a scripted agent drives the real wire protocol
//! against a live listener.

use reverb_bridge::{Bridge, BridgeConfig, BridgeEvent};
use reverb_proto::{consts, md5_hex, FramedStream, Mux, MuxSide};
use reverb_store::{AgentProfile, Store, Tunnel, TunnelMode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const VKEY: &str = "aaaaaaaaaaaaaaaa";

async fn start_bridge(
    profile: AgentProfile,
) -> (Arc<Bridge>, Arc<Store>, SocketAddr, mpsc::Receiver<BridgeEvent>, i32) {
    let store = Arc::new(Store::new());
    let agent = store.create_agent(VKEY.into(), profile).unwrap();
    let (bridge, events) = Bridge::new(store.clone(), BridgeConfig::default());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
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
    (bridge, store, addr, events, agent.id)
}

/// Run the agent side of the handshake up to the work-type token.
async fn agent_handshake(addr: SocketAddr, work: [u8; 4]) -> FramedStream<TcpStream> {
    let conn = TcpStream::connect(addr).await.unwrap();
    let mut framed = FramedStream::new(conn);

    framed.write_raw(consts::CONN_TEST).await.unwrap();
    framed
        .write_len_content(consts::CORE_VERSION.as_bytes())
        .await
        .unwrap();
    framed.write_len_content(b"test-agent-1.0").await.unwrap();

    let digest = framed.read_exact_content(32).await.unwrap();
    assert_eq!(digest, md5_hex(consts::CORE_VERSION).as_bytes());

    framed.write_raw(md5_hex(VKEY).as_bytes()).await.unwrap();
    let reply = framed.read_flag().await.unwrap();
    assert_eq!(reply, consts::VERIFY_SUCCESS);

    framed.write_flag(work).await.unwrap();
    framed
}

#[tokio::test]
async fn version_mismatch_closes_the_connection() {
    let (_bridge, _store, addr, _events, _id) = start_bridge(AgentProfile::default()).await;

    let conn = TcpStream::connect(addr).await.unwrap();
    let mut framed = FramedStream::new(conn);
    framed.write_raw(consts::CONN_TEST).await.unwrap();
    framed.write_len_content(b"0.0.1-bogus").await.unwrap();

    // the server must hang up without ever sending the version digest
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), framed.get_mut().read(&mut buf))
        .await
        .expect("server should close");
    match read {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected {n} bytes after version mismatch"),
    }
}

#[tokio::test]
async fn bad_verify_key_gets_the_error_token() {
    let (_bridge, _store, addr, _events, _id) = start_bridge(AgentProfile::default()).await;

    let conn = TcpStream::connect(addr).await.unwrap();
    let mut framed = FramedStream::new(conn);
    framed.write_raw(consts::CONN_TEST).await.unwrap();
    framed
        .write_len_content(consts::CORE_VERSION.as_bytes())
        .await
        .unwrap();
    framed.write_len_content(b"test-agent").await.unwrap();
    framed.read_exact_content(32).await.unwrap();

    framed
        .write_raw(md5_hex("wrong-key-entirely").as_bytes())
        .await
        .unwrap();
    assert_eq!(framed.read_flag().await.unwrap(), consts::VERIFY_ERROR);
}

#[tokio::test]
async fn main_work_type_attaches_the_signal() {
    let (bridge, _store, addr, _events, agent_id) = start_bridge(AgentProfile::default()).await;

    let _signal = agent_handshake(addr, consts::WORK_MAIN).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(bridge.is_online(agent_id));
    assert_eq!(bridge.agent_version(agent_id).as_deref(), Some("test-agent-1.0"));
}

#[tokio::test]
async fn relogin_displaces_the_previous_signal() {
    let (bridge, _store, addr, _events, agent_id) = start_bridge(AgentProfile::default()).await;

    let mut first = agent_handshake(addr, consts::WORK_MAIN).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let _second = agent_handshake(addr, consts::WORK_MAIN).await;

    // the first signal receives the close token
    let flag = tokio::time::timeout(Duration::from_secs(2), first.read_flag())
        .await
        .expect("close token expected")
        .unwrap();
    assert_eq!(flag, consts::RES_CLOSE);
    assert!(bridge.is_online(agent_id));
}

#[tokio::test]
async fn chan_mux_carries_link_streams_both_ways() {
    let (bridge, store, addr, _events, agent_id) = start_bridge(AgentProfile::default()).await;
    store
        .create_tunnel(Tunnel::new(
            store.alloc_tunnel_id(),
            agent_id,
            TunnelMode::Tcp,
            0,
            "",
            "127.0.0.1:2222",
            false,
        ))
        .unwrap();

    let chan = agent_handshake(addr, consts::WORK_CHAN).await;
    let agent_mux = Mux::new(chan.into_inner(), MuxSide::Client, Duration::from_secs(60));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // scripted agent: accept the stream, check the descriptor, echo bytes
    let agent_task = tokio::spawn(async move {
        let stream = agent_mux.accept_stream().await.unwrap();
        let mut framed = FramedStream::new(stream);
        let link: reverb_proto::Link = framed.read_json().await.unwrap();
        assert_eq!(link.host, "127.0.0.1:2222");
        assert_eq!(link.conn_type, "tcp");

        let mut stream = framed.into_inner();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
        stream.flush().await.unwrap();
    });

    let link = reverb_proto::Link::new("tcp", "127.0.0.1:2222", false, false, "7.7.7.7:1", false);
    let mut target = bridge.send_link_info(agent_id, link, None).await.unwrap();

    target.write_all(b"hello").await.unwrap();
    target.flush().await.unwrap();
    let mut buf = [0u8; 5];
    target.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
    agent_task.await.unwrap();
}

#[tokio::test]
async fn secret_work_type_emits_a_pairing_event() {
    let (_bridge, _store, addr, mut events, _id) = start_bridge(AgentProfile::default()).await;

    let mut framed = agent_handshake(addr, consts::WORK_SECRET).await;
    framed
        .write_raw(md5_hex("open sesame").as_bytes())
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        BridgeEvent::Secret {
            password_digest, ..
        } => assert_eq!(password_digest, md5_hex("open sesame")),
        _ => panic!("expected a secret pairing event"),
    }
}

#[tokio::test]
async fn health_report_prunes_tunnel_targets() {
    let (_bridge, store, addr, _events, agent_id) = start_bridge(AgentProfile::default()).await;
    let tunnel = store
        .create_tunnel(Tunnel::new(
            store.alloc_tunnel_id(),
            agent_id,
            TunnelMode::Tcp,
            0,
            "",
            "10.0.0.1:22\n10.0.0.2:22",
            false,
        ))
        .unwrap();

    let mut signal = agent_handshake(addr, consts::WORK_MAIN).await;
    signal.write_health("10.0.0.1:22", false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    for _ in 0..8 {
        assert_eq!(tunnel.targets.select().unwrap(), "10.0.0.2:22");
    }

    signal.write_health("10.0.0.1:22", true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(tunnel.targets.live_count(), 2);
}

#[tokio::test]
async fn config_channel_rejects_mismatched_port_and_target_counts() {
    let mut profile = AgentProfile::default();
    profile.allow_config_channel = true;
    let (_bridge, store, addr, _events, agent_id) = start_bridge(profile).await;

    let mut framed = agent_handshake(addr, consts::WORK_CONFIG).await;
    // is_public reply
    assert!(!framed.read_bool().await.unwrap());

    framed.write_flag(consts::NEW_TASK).await.unwrap();
    framed
        .send_json(&serde_json::json!({
            "mode": "tcp",
            "ports": "7000-7002",
            "targets": "8000,8001",
        }))
        .await
        .unwrap();

    assert!(!framed.read_bool().await.unwrap());
    tokio::time::sleep(Duration::from_millis(200)).await;
    // the failing channel deletes the agent it was configuring
    assert!(store.get_agent(agent_id).is_err());
}

#[tokio::test]
async fn config_channel_rejects_multi_port_on_non_port_mapped_modes() {
    let mut profile = AgentProfile::default();
    profile.allow_config_channel = true;
    let (_bridge, store, addr, _events, agent_id) = start_bridge(profile).await;

    let mut framed = agent_handshake(addr, consts::WORK_CONFIG).await;
    assert!(!framed.read_bool().await.unwrap());

    // httpProxy has no per-port target list; a range must fail cleanly
    framed.write_flag(consts::NEW_TASK).await.unwrap();
    framed
        .send_json(&serde_json::json!({
            "mode": "httpProxy",
            "ports": "8080-8082",
            "targets": "",
        }))
        .await
        .unwrap();

    assert!(!framed.read_bool().await.unwrap());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(store.get_agent(agent_id).is_err());
    assert!(store.tunnels_for_agent(agent_id).is_empty());
}

#[tokio::test]
async fn config_channel_registers_tunnels_and_opens_tasks() {
    let mut profile = AgentProfile::default();
    profile.allow_config_channel = true;
    let (_bridge, store, addr, mut events, agent_id) = start_bridge(profile).await;

    let mut framed = agent_handshake(addr, consts::WORK_CONFIG).await;
    assert!(!framed.read_bool().await.unwrap());

    framed.write_flag(consts::NEW_TASK).await.unwrap();
    framed
        .send_json(&serde_json::json!({
            "mode": "tcp",
            "ports": "0",
            "targets": "127.0.0.1:9000",
            "remark": "ssh",
        }))
        .await
        .unwrap();
    assert!(framed.read_bool().await.unwrap());

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        BridgeEvent::OpenTunnel(tunnel) => {
            assert_eq!(tunnel.agent_id, agent_id);
            assert!(tunnel.no_store);
        }
        _ => panic!("expected an open-tunnel event"),
    }
    assert_eq!(store.tunnels_for_agent(agent_id).len(), 1);
}
