//! reverb server binary: wires the bridge, the ingress fabric and the admin
//! surface together from one configuration.

mod config;
mod server;

use anyhow::{Context, Result};
use clap::Parser;
use config::ServerConfig;
use reverb_admin::{AdminConfig, AdminState};
use reverb_bridge::{Bridge, BridgeConfig};
use reverb_proxy::base::ProxyBase;
use reverb_proxy::p2p::P2pRendezvous;
use reverb_proxy::PortMux;
use reverb_store::{AgentProfile, Store};
use server::{Ingress, Supervisor};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let config = ServerConfig::parse();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid configuration")?;

    let store = Arc::new(Store::new());
    seed_public_agent(&store, &config);

    let (bridge, events) = Bridge::new(
        store.clone(),
        BridgeConfig {
            ip_verify: config.ip_limit,
            disconnect_timeout: config.disconnect_timeout,
            p2p_endpoint: config.p2p_endpoint(),
        },
    );

    let error_content = match &config.error_page {
        Some(path) => bytes::Bytes::from(
            std::fs::read(path).with_context(|| format!("read error page {}", path.display()))?,
        ),
        None => bytes::Bytes::from_static(b"reverb: no service is published here\n"),
    };
    let base = ProxyBase::new(store.clone(), bridge.clone(), error_content);
    let supervisor = Supervisor::new(config.clone(), store.clone(), bridge.clone(), base);

    // shared-port multiplexing when any surface rides the bridge port
    let (bridge_ingress, http_ingress, https_ingress, admin_ingress) = if config.needs_port_mux() {
        let (mux, bridge_sub, http_sub, https_sub, admin_sub) =
            PortMux::bind(&config.bridge_addr(), &config.admin_host)
                .await
                .with_context(|| format!("bind shared port {}", config.bridge_addr()))?;
        info!(addr = %config.bridge_addr(), "shared-port multiplexer started");
        tokio::spawn(mux.run());
        (
            Ingress::Mux(bridge_sub),
            config
                .shares_bridge_port(config.http_proxy_port)
                .then_some(Ingress::Mux(http_sub)),
            config
                .shares_bridge_port(config.https_proxy_port)
                .then_some(Ingress::Mux(https_sub)),
            config
                .shares_bridge_port(config.admin_port)
                .then_some(Ingress::Mux(admin_sub)),
        )
    } else {
        let listener = TcpListener::bind(config.bridge_addr())
            .await
            .with_context(|| format!("bind bridge port {}", config.bridge_addr()))?;
        (Ingress::Tcp(listener), None, None, None)
    };
    info!(
        addr = %config.bridge_addr(),
        version = reverb_proto::consts::CORE_VERSION,
        "bridge listening"
    );

    // dedicated listeners for surfaces not sharing the bridge port
    let http_ingress = match http_ingress {
        Some(i) => Some(i),
        None => match config.http_proxy_port {
            Some(port) if !config.shares_bridge_port(Some(port)) => {
                let addr = format!("{}:{port}", config.bridge_ip);
                let l = TcpListener::bind(&addr)
                    .await
                    .with_context(|| format!("bind http proxy port {addr}"))?;
                info!(%addr, "http vhost proxy listening");
                Some(Ingress::Tcp(l))
            }
            _ => None,
        },
    };
    let https_ingress = match https_ingress {
        Some(i) => Some(i),
        None => match config.https_proxy_port {
            Some(port) if !config.shares_bridge_port(Some(port)) => {
                let addr = format!("{}:{port}", config.bridge_ip);
                let l = TcpListener::bind(&addr)
                    .await
                    .with_context(|| format!("bind https proxy port {addr}"))?;
                info!(%addr, "https listener started");
                Some(Ingress::Tcp(l))
            }
            _ => None,
        },
    };

    // admin surface: axum on its own socket; shared-port admin connections
    // are piped over to it
    if config.admin_port.is_some() {
        let admin_state = AdminState::new(
            store.clone(),
            bridge.clone(),
            supervisor.clone(),
            AdminConfig {
                username: config.admin_username.clone(),
                password: config.admin_password.clone(),
                auth_key: config.auth_key.clone(),
                auth_crypt_key: config.auth_crypt_key.clone(),
                bridge_port: config.bridge_port,
            },
        );
        let router = reverb_admin::build_router(admin_state);
        let admin_addr = if config.shares_bridge_port(config.admin_port) {
            "127.0.0.1:0".to_string()
        } else {
            format!("{}:{}", config.bridge_ip, config.admin_port.unwrap())
        };
        let listener = TcpListener::bind(&admin_addr)
            .await
            .with_context(|| format!("bind admin port {admin_addr}"))?;
        let bound = listener.local_addr()?;
        info!(addr = %bound, "admin api listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!("admin server stopped: {}", e);
            }
        });

        if let Some(mut ingress) = admin_ingress {
            tokio::spawn(async move {
                while let Some((conn, _peer)) = ingress.next().await {
                    tokio::spawn(async move {
                        match tokio::net::TcpStream::connect(bound).await {
                            Ok(inner) => {
                                let _ =
                                    reverb_proxy::pipe::relay(conn, Box::new(inner), None).await;
                            }
                            Err(e) => warn!("admin handoff failed: {}", e),
                        }
                    });
                }
            });
        }
    }

    // P2P rendezvous triple
    if let Some(port) = config.p2p_port {
        let rendezvous = P2pRendezvous::new(&config.p2p_ip, port);
        tokio::spawn(async move {
            if let Err(e) = rendezvous.run().await {
                error!("p2p rendezvous stopped: {}", e);
            }
        });
    }

    // supervisors
    bridge.spawn_heartbeat();
    supervisor.spawn_flow_tick();
    tokio::spawn(supervisor.clone().run_events(events));
    supervisor.start_existing().await;

    // vhost ingress pumps
    if let Some(mut ingress) = http_ingress {
        let vhost = supervisor.vhost.clone();
        tokio::spawn(async move {
            while let Some((conn, peer)) = ingress.next().await {
                let vhost = vhost.clone();
                tokio::spawn(async move {
                    vhost.handle_connection(conn, peer, "http").await;
                });
            }
        });
    }
    if let Some(mut ingress) = https_ingress {
        let https = supervisor.https.clone();
        tokio::spawn(async move {
            while let Some((conn, peer)) = ingress.next().await {
                let https = https.clone();
                tokio::spawn(async move {
                    https.handle_connection(conn, peer).await;
                });
            }
        });
    }

    // bridge accept loop with ctrl-c shutdown
    let mut bridge_ingress = bridge_ingress;
    let accept_bridge = {
        let bridge = bridge.clone();
        async move {
            while let Some((conn, peer)) = bridge_ingress.next().await {
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    bridge.handle_conn(conn, peer).await;
                });
            }
        }
    };

    tokio::select! {
        _ = accept_bridge => {
            error!("bridge listener stopped unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }
    Ok(())
}

/// Seed the hidden public-pool agent when `public_vkey` is configured: not
/// displayed, config channel allowed, never persisted.
fn seed_public_agent(store: &Arc<Store>, config: &ServerConfig) {
    let Some(vkey) = &config.public_vkey else {
        return;
    };
    let profile = AgentProfile {
        remark: "public".to_string(),
        allow_config_channel: true,
        no_display: true,
        ..Default::default()
    };
    match store.create_agent(vkey.clone(), profile) {
        Ok(agent) => info!(agent_id = agent.id, "public pool agent seeded"),
        Err(e) => warn!("could not seed public agent: {}", e),
    }
}
