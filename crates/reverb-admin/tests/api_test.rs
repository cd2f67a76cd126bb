//! Admin surface tests driven through the router with tower's oneshot.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use reverb_admin::{build_router, AdminConfig, AdminState, TaskControl};
use reverb_bridge::{Bridge, BridgeConfig};
use reverb_proto::md5_hex;
use reverb_store::{AgentProfile, Store};
use std::sync::Arc;
use tower::ServiceExt;

struct NoopControl;

#[async_trait::async_trait]
impl TaskControl for NoopControl {
    async fn start_tunnel(&self, _id: i32) -> Result<(), String> {
        Ok(())
    }

    async fn stop_tunnel(&self, _id: i32) -> Result<(), String> {
        Ok(())
    }
}

fn state() -> AdminState {
    let store = Arc::new(Store::new());
    let (bridge, _events) = Bridge::new(store.clone(), BridgeConfig::default());
    AdminState::new(
        store,
        bridge,
        Arc::new(NoopControl),
        AdminConfig {
            username: "admin".into(),
            password: "hunter2".into(),
            auth_key: "serversecret".into(),
            auth_crypt_key: "0123456789abcdef".into(),
            bridge_port: 8024,
        },
    )
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn form_post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn unauthenticated_requests_are_rejected() {
    let app = build_router(state());
    let response = app
        .oneshot(form_post("/client/list", "start=0&length=10"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn login_with_wrong_password_fails() {
    let app = build_router(state());
    let response = app
        .oneshot(form_post("/login/verify", "username=admin&password=wrong"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["code"], 0);
}

#[tokio::test]
async fn session_cookie_grants_admin_access() {
    let state = state();
    let app = build_router(state.clone());

    let response = app
        .clone()
        .oneshot(form_post("/login/verify", "username=admin&password=hunter2"))
        .await
        .unwrap();
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();

    let mut request = form_post("/client/list", "start=0&length=10");
    request
        .headers_mut()
        .insert(header::COOKIE, cookie.parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["code"], 1);
    assert_eq!(body["data"]["cnt"], 0);
}

#[tokio::test]
async fn auth_key_with_fresh_timestamp_grants_access() {
    let app = build_router(state());
    let ts = Utc::now().timestamp();
    let key = md5_hex(&format!("serversecret{ts}"));

    let response = app
        .oneshot(form_post(
            &format!("/status/info?auth_key={key}&timestamp={ts}"),
            "",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["bridge_port"], 8024);
}

#[tokio::test]
async fn stale_auth_key_is_rejected() {
    let app = build_router(state());
    let ts = Utc::now().timestamp() - 60;
    let key = md5_hex(&format!("serversecret{ts}"));

    let response = app
        .oneshot(form_post(
            &format!("/status/info?auth_key={key}&timestamp={ts}"),
            "",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn agent_role_sees_only_its_own_records() {
    let state = state();
    let mine = state
        .store
        .create_agent(
            "dddddddddddddddd".into(),
            AgentProfile {
                web_username: "tenant".into(),
                web_password: "pw".into(),
                ..Default::default()
            },
        )
        .unwrap();
    state
        .store
        .create_agent("eeeeeeeeeeeeeeee".into(), AgentProfile::default())
        .unwrap();

    let app = build_router(state.clone());
    let response = app
        .clone()
        .oneshot(form_post("/login/verify", "username=tenant&password=pw"))
        .await
        .unwrap();
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();

    let mut request = form_post("/client/list", "start=0&length=10");
    request
        .headers_mut()
        .insert(header::COOKIE, cookie.parse().unwrap());
    let body = body_json(app.clone().oneshot(request).await.unwrap()).await;
    assert_eq!(body["data"]["cnt"], 1);
    assert_eq!(body["data"]["list"][0]["id"], mine.id);

    // and cannot create agents
    let mut request = form_post("/client/add", "remark=nope");
    request
        .headers_mut()
        .insert(header::COOKIE, cookie.parse().unwrap());
    let body = body_json(app.oneshot(request).await.unwrap()).await;
    assert_eq!(body["code"], 0);
}

#[tokio::test]
async fn tunnel_crud_round_trip() {
    let state = state();
    let agent = state
        .store
        .create_agent("ffffffffffffffff".into(), AgentProfile::default())
        .unwrap();
    let app = build_router(state.clone());
    let ts = Utc::now().timestamp();
    let key = md5_hex(&format!("serversecret{ts}"));
    let auth = format!("auth_key={key}&timestamp={ts}");

    let body = body_json(
        app.clone()
            .oneshot(form_post(
                &format!("/index/addtunnel?{auth}"),
                &format!("client_id={}&mode=tcp&port=0&target=127.0.0.1:9000", agent.id),
            ))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["code"], 1);
    let id = body["data"]["id"].as_i64().unwrap() as i32;
    assert!(state.store.get_tunnel(id).is_ok());

    let ts = Utc::now().timestamp();
    let key = md5_hex(&format!("serversecret{ts}"));
    let body = body_json(
        app.oneshot(form_post(
            &format!("/index/deltunnel?auth_key={key}&timestamp={ts}"),
            &format!("id={id}"),
        ))
        .await
        .unwrap(),
    )
    .await;
    assert_eq!(body["code"], 1);
    assert!(state.store.get_tunnel(id).is_err());
}

#[tokio::test]
async fn get_auth_key_returns_sealed_secret() {
    let app = build_router(state());
    let response = app
        .oneshot(form_post("/auth/getauthkey", ""))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], 1);
    assert_eq!(body["crypt_type"], "chacha20-poly1305");
    assert!(!body["crypt_auth_key"].as_str().unwrap().is_empty());
}
