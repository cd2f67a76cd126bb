//! Admin endpoint handlers.

use crate::auth::{self, Role, SESSION_COOKIE};
use crate::models::*;
use crate::AdminState;
use axum::extract::State;
use axum::http::header;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Form, Json, Router};
use chrono::Utc;
use reverb_proto::md5_hex;
use reverb_store::{Host, HostScheme, ListQuery, Tunnel, TunnelMode};
use serde_json::json;
use std::collections::HashMap;
use tracing::info;

pub fn router(state: AdminState) -> Router {
    let protected = Router::new()
        .route("/client/list", post(client_list))
        .route("/client/add", post(client_add))
        .route("/client/edit", post(client_edit))
        .route("/client/del", post(client_del))
        .route("/client/changestatus", post(client_change_status))
        .route("/index/gettunnel", post(tunnel_list))
        .route("/index/addtunnel", post(tunnel_add))
        .route("/index/edittunnel", post(tunnel_edit))
        .route("/index/deltunnel", post(tunnel_del))
        .route("/index/starttunnel", post(tunnel_start))
        .route("/index/stoptunnel", post(tunnel_stop))
        .route("/index/gethost", post(host_list))
        .route("/index/addhost", post(host_add))
        .route("/index/edithost", post(host_edit))
        .route("/index/delhost", post(host_del))
        .route("/status/info", get(status_info).post(status_info))
        .route("/status/stats", get(status_stats).post(status_stats))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/login/verify", post(login_verify))
        .route("/auth/gettime", get(get_time).post(get_time))
        .route("/auth/getauthkey", post(get_auth_key))
        .merge(protected)
        .with_state(state)
}

// ---- auth ----

async fn login_verify(State(state): State<AdminState>, Form(form): Form<LoginForm>) -> Response {
    let role = if !state.config.username.is_empty()
        && form.username == state.config.username
        && form.password == state.config.password
    {
        Some(Role::Admin)
    } else {
        state
            .store
            .agent_by_web_login(&form.username, &form.password)
            .map(|agent| Role::Agent(agent.id))
    };

    let Some(role) = role else {
        return fail("username or password incorrect").into_response();
    };

    let token = auth::new_session_token();
    state.sessions.lock().unwrap().insert(token.clone(), role);
    info!(username = %form.username, admin = role.is_admin(), "admin login");

    let cookie = format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly");
    (
        [(header::SET_COOKIE, cookie)],
        ok(json!({ "admin": role.is_admin() })),
    )
        .into_response()
}

async fn get_time() -> Json<serde_json::Value> {
    Json(json!({ "time": Utc::now().timestamp() }))
}

/// Hand out the auth_key encrypted under the configured crypt key so remote
/// tooling can use the timestamped scheme without the secret in the clear.
async fn get_auth_key(State(state): State<AdminState>) -> Json<serde_json::Value> {
    if state.config.auth_crypt_key.len() != 16 {
        return Json(json!({ "status": 0 }));
    }
    match encrypt_auth_key(&state.config.auth_key, &state.config.auth_crypt_key) {
        Some(sealed) => Json(json!({
            "status": 1,
            "crypt_auth_key": sealed,
            "crypt_type": "chacha20-poly1305",
        })),
        None => Json(json!({ "status": 0 })),
    }
}

fn encrypt_auth_key(auth_key: &str, crypt_key: &str) -> Option<String> {
    use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
    use ring::rand::{SecureRandom, SystemRandom};

    // derive a 32-byte key from the configured 16-char key
    let derived = md5_hex(crypt_key);
    let key = UnboundKey::new(&CHACHA20_POLY1305, derived.as_bytes()).ok()?;
    let key = LessSafeKey::new(key);

    let mut nonce_bytes = [0u8; 12];
    SystemRandom::new().fill(&mut nonce_bytes).ok()?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut sealed = auth_key.as_bytes().to_vec();
    key.seal_in_place_append_tag(nonce, Aad::empty(), &mut sealed)
        .ok()?;

    let mut out = hex(&nonce_bytes);
    out.push_str(&hex(&sealed));
    Some(out)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---- clients ----

async fn client_list(
    State(state): State<AdminState>,
    Extension(role): Extension<Role>,
    Form(form): Form<ListForm>,
) -> Json<serde_json::Value> {
    let (list, total) = state.store.list_agents(&ListQuery {
        start: form.start,
        length: form.length,
        search: form.search,
        sort: form.sort,
        order: form.order,
        agent_id: role.scope(),
    });
    let views: Vec<AgentView> = list
        .iter()
        .map(|a| AgentView::from(a, &state.bridge))
        .collect();
    ok(json!({ "list": views, "cnt": total }))
}

async fn client_add(
    State(state): State<AdminState>,
    Extension(role): Extension<Role>,
    Form(form): Form<ClientForm>,
) -> Json<serde_json::Value> {
    if !role.is_admin() {
        return fail("permission denied");
    }
    match state.store.create_agent(form.vkey.clone(), profile_of(&form)) {
        Ok(agent) => ok(json!({ "id": agent.id, "vkey": agent.verify_key })),
        Err(e) => fail(e),
    }
}

async fn client_edit(
    State(state): State<AdminState>,
    Extension(role): Extension<Role>,
    Form(form): Form<ClientForm>,
) -> Json<serde_json::Value> {
    if !role.is_admin() && role.scope() != form.id {
        return fail("permission denied");
    }
    match state.store.update_agent(form.id, profile_of(&form)) {
        Ok(()) => ok(json!({})),
        Err(e) => fail(e),
    }
}

async fn client_del(
    State(state): State<AdminState>,
    Extension(role): Extension<Role>,
    Form(form): Form<IdForm>,
) -> Json<serde_json::Value> {
    if !role.is_admin() {
        return fail("permission denied");
    }
    let tunnels = state.store.tunnels_for_agent(form.id);
    if let Err(e) = state.store.delete_agent(form.id) {
        return fail(e);
    }
    for tunnel in tunnels {
        let _ = state.control.stop_tunnel(tunnel.id).await;
    }
    state.bridge.del_agent(form.id).await;
    ok(json!({}))
}

async fn client_change_status(
    State(state): State<AdminState>,
    Extension(role): Extension<Role>,
    Form(form): Form<IdForm>,
) -> Json<serde_json::Value> {
    if !role.is_admin() {
        return fail("permission denied");
    }
    match state.store.get_agent(form.id) {
        Ok(agent) => {
            let mut profile = agent.profile();
            profile.enabled = !profile.enabled;
            let enabled = profile.enabled;
            agent.set_profile(profile);
            if !enabled {
                state.bridge.del_agent(form.id).await;
            }
            ok(json!({ "enabled": enabled }))
        }
        Err(e) => fail(e),
    }
}

fn profile_of(form: &ClientForm) -> reverb_store::AgentProfile {
    reverb_store::AgentProfile {
        remark: form.remark.clone(),
        auth_user: form.auth_user.clone(),
        auth_password: form.auth_password.clone(),
        crypt: form.crypt,
        compress: form.compress,
        enabled: form.enabled,
        rate_limit: form.rate_limit,
        max_conn: form.max_conn,
        max_tunnels: form.max_tunnels,
        flow_limit: form.flow_limit,
        allow_config_channel: form.allow_config_channel,
        web_username: form.web_username.clone(),
        web_password: form.web_password.clone(),
        no_display: false,
    }
}

// ---- tunnels ----

async fn tunnel_list(
    State(state): State<AdminState>,
    Extension(role): Extension<Role>,
    Form(form): Form<ListForm>,
) -> Json<serde_json::Value> {
    let (list, total) = state.store.list_tunnels(&ListQuery {
        start: form.start,
        length: form.length,
        search: form.search,
        agent_id: role.scope(),
        ..Default::default()
    });
    let views: Vec<TunnelView> = list.iter().map(TunnelView::from).collect();
    ok(json!({ "list": views, "cnt": total }))
}

fn tunnel_of(form: &TunnelForm, id: i32) -> Result<Tunnel, String> {
    let mode: TunnelMode = form.mode.parse()?;
    let port = if mode.is_listenerless() { 0 } else { form.port };
    let mut tunnel = Tunnel::new(
        id,
        form.client_id,
        mode,
        port,
        &form.server_ip,
        &form.target,
        form.local_proxy,
    );
    tunnel.password = form.password.clone();
    tunnel.remark = form.remark.clone();
    tunnel.local_path = form.local_path.clone();
    tunnel.strip_prefix = form.strip_prefix.clone();
    if !form.multi_account.is_empty() {
        let map: HashMap<String, String> = form
            .multi_account
            .split('\n')
            .filter_map(|line| {
                line.trim()
                    .split_once(':')
                    .map(|(u, p)| (u.to_string(), p.to_string()))
            })
            .collect();
        if !map.is_empty() {
            tunnel.multi_accounts = Some(map);
        }
    }
    Ok(tunnel)
}

async fn tunnel_add(
    State(state): State<AdminState>,
    Extension(role): Extension<Role>,
    Form(form): Form<TunnelForm>,
) -> Json<serde_json::Value> {
    if !role.is_admin() && role.scope() != form.client_id {
        return fail("permission denied");
    }
    if state.store.get_agent(form.client_id).is_err() {
        return fail("client not found");
    }
    let tunnel = match tunnel_of(&form, state.store.alloc_tunnel_id()) {
        Ok(t) => t,
        Err(e) => return fail(e),
    };
    if !tunnel.mode.is_listenerless()
        && !reverb_bridge::test_port_open(&tunnel.bind_addr(), tunnel.mode).await
    {
        return fail(format!("the port {} cannot be opened", tunnel.port));
    }
    match state.store.create_tunnel(tunnel) {
        Ok(tunnel) => {
            if let Err(e) = state.control.start_tunnel(tunnel.id).await {
                return fail(e);
            }
            ok(json!({ "id": tunnel.id }))
        }
        Err(e) => fail(e),
    }
}

async fn tunnel_edit(
    State(state): State<AdminState>,
    Extension(role): Extension<Role>,
    Form(form): Form<TunnelForm>,
) -> Json<serde_json::Value> {
    let existing = match state.store.get_tunnel(form.id) {
        Ok(t) => t,
        Err(e) => return fail(e),
    };
    if !role.is_admin() && role.scope() != existing.agent_id {
        return fail("permission denied");
    }
    let tunnel = match tunnel_of(&form, form.id) {
        Ok(t) => t,
        Err(e) => return fail(e),
    };
    let _ = state.control.stop_tunnel(form.id).await;
    match state.store.update_tunnel(tunnel) {
        Ok(tunnel) => {
            if tunnel.enabled() {
                let _ = state.control.start_tunnel(tunnel.id).await;
            }
            ok(json!({}))
        }
        Err(e) => fail(e),
    }
}

async fn tunnel_del(
    State(state): State<AdminState>,
    Extension(role): Extension<Role>,
    Form(form): Form<IdForm>,
) -> Json<serde_json::Value> {
    let existing = match state.store.get_tunnel(form.id) {
        Ok(t) => t,
        Err(e) => return fail(e),
    };
    if !role.is_admin() && role.scope() != existing.agent_id {
        return fail("permission denied");
    }
    let _ = state.control.stop_tunnel(form.id).await;
    match state.store.delete_tunnel(form.id) {
        Ok(()) => ok(json!({})),
        Err(e) => fail(e),
    }
}

async fn tunnel_start(
    State(state): State<AdminState>,
    Extension(role): Extension<Role>,
    Form(form): Form<IdForm>,
) -> Json<serde_json::Value> {
    let tunnel = match state.store.get_tunnel(form.id) {
        Ok(t) => t,
        Err(e) => return fail(e),
    };
    if !role.is_admin() && role.scope() != tunnel.agent_id {
        return fail("permission denied");
    }
    tunnel.set_enabled(true);
    match state.control.start_tunnel(form.id).await {
        Ok(()) => ok(json!({})),
        Err(e) => fail(e),
    }
}

async fn tunnel_stop(
    State(state): State<AdminState>,
    Extension(role): Extension<Role>,
    Form(form): Form<IdForm>,
) -> Json<serde_json::Value> {
    let tunnel = match state.store.get_tunnel(form.id) {
        Ok(t) => t,
        Err(e) => return fail(e),
    };
    if !role.is_admin() && role.scope() != tunnel.agent_id {
        return fail("permission denied");
    }
    tunnel.set_enabled(false);
    match state.control.stop_tunnel(form.id).await {
        Ok(()) => ok(json!({})),
        Err(e) => fail(e),
    }
}

// ---- hosts ----

async fn host_list(
    State(state): State<AdminState>,
    Extension(role): Extension<Role>,
    Form(form): Form<ListForm>,
) -> Json<serde_json::Value> {
    let (list, total) = state.store.list_hosts(&ListQuery {
        start: form.start,
        length: form.length,
        search: form.search,
        agent_id: role.scope(),
        ..Default::default()
    });
    let views: Vec<HostView> = list.iter().map(HostView::from).collect();
    ok(json!({ "list": views, "cnt": total }))
}

fn host_of(form: &HostForm, id: i32) -> Result<Host, String> {
    let scheme: HostScheme = form.scheme.parse()?;
    let mut host = Host::new(
        id,
        form.client_id,
        &form.host,
        &form.location,
        scheme,
        &form.target,
    );
    host.remark = form.remark.clone();
    host.host_rewrite = form.host_rewrite.clone();
    host.extra_headers = form.extra_headers.clone();
    host.cert_path = form.cert_path.clone();
    host.key_path = form.key_path.clone();
    Ok(host)
}

async fn host_add(
    State(state): State<AdminState>,
    Extension(role): Extension<Role>,
    Form(form): Form<HostForm>,
) -> Json<serde_json::Value> {
    if !role.is_admin() && role.scope() != form.client_id {
        return fail("permission denied");
    }
    if state.store.get_agent(form.client_id).is_err() {
        return fail("client not found");
    }
    let host = match host_of(&form, state.store.alloc_host_id()) {
        Ok(h) => h,
        Err(e) => return fail(e),
    };
    match state.store.create_host(host) {
        Ok(host) => ok(json!({ "id": host.id })),
        Err(e) => fail(e),
    }
}

async fn host_edit(
    State(state): State<AdminState>,
    Extension(role): Extension<Role>,
    Form(form): Form<HostForm>,
) -> Json<serde_json::Value> {
    let existing = match state.store.get_host(form.id) {
        Ok(h) => h,
        Err(e) => return fail(e),
    };
    if !role.is_admin() && role.scope() != existing.agent_id {
        return fail("permission denied");
    }
    let host = match host_of(&form, form.id) {
        Ok(h) => h,
        Err(e) => return fail(e),
    };
    match state.store.update_host(host) {
        Ok(_) => ok(json!({})),
        Err(e) => fail(e),
    }
}

async fn host_del(
    State(state): State<AdminState>,
    Extension(role): Extension<Role>,
    Form(form): Form<IdForm>,
) -> Json<serde_json::Value> {
    let existing = match state.store.get_host(form.id) {
        Ok(h) => h,
        Err(e) => return fail(e),
    };
    if !role.is_admin() && role.scope() != existing.agent_id {
        return fail("permission denied");
    }
    match state.store.delete_host(form.id) {
        Ok(()) => ok(json!({})),
        Err(e) => fail(e),
    }
}

// ---- status ----

async fn status_stats(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let (agents, _) = state.store.list_agents(&ListQuery::default());
    let inlet: i64 = agents.iter().map(|a| a.flow.inlet()).sum();
    let export: i64 = agents.iter().map(|a| a.flow.export()).sum();
    let conns: i32 = agents.iter().map(|a| a.now_conn()).sum();
    ok(json!({
        "inlet_flow": inlet,
        "export_flow": export,
        "connections": conns,
    }))
}

async fn status_info(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let (_, agents) = state.store.list_agents(&ListQuery::default());
    let (_, tunnels) = state.store.list_tunnels(&ListQuery::default());
    let (_, hosts) = state.store.list_hosts(&ListQuery::default());
    ok(json!({
        "bridge_port": state.config.bridge_port,
        "agents": agents,
        "agents_online": state.bridge.online_count(),
        "tunnels": tunnels,
        "hosts": hosts,
        "version": reverb_proto::consts::CORE_VERSION,
    }))
}
