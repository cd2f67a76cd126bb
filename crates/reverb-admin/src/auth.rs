//! Admin authentication: session cookies and the timestamped auth_key.

use crate::AdminState;
use axum::extract::{Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use rand::Rng;
use reverb_proto::md5_hex;
use serde::Deserialize;

pub const SESSION_COOKIE: &str = "reverb_session";

/// Window for the md5(auth_key + timestamp) scheme, seconds.
const AUTH_KEY_WINDOW: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    /// Agent-scoped: sees and edits only its own records.
    Agent(i32),
}

impl Role {
    pub fn scope(&self) -> i32 {
        match self {
            Role::Admin => 0,
            Role::Agent(id) => *id,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthKeyParams {
    #[serde(default)]
    auth_key: String,
    #[serde(default)]
    timestamp: i64,
}

/// Validate `auth_key == md5(secret + timestamp)` with |now - ts| <= 20 s.
pub fn auth_key_valid(secret: &str, auth_key: &str, timestamp: i64) -> bool {
    if secret.is_empty() || auth_key.is_empty() {
        return false;
    }
    let now = Utc::now().timestamp();
    if (now - timestamp).abs() > AUTH_KEY_WINDOW {
        return false;
    }
    md5_hex(&format!("{secret}{timestamp}")) == auth_key
}

pub fn new_session_token() -> String {
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| {
            let c: u8 = rng.gen_range(0..36);
            if c < 10 {
                (b'0' + c) as char
            } else {
                (b'a' + c - 10) as char
            }
        })
        .collect()
}

fn session_role(state: &AdminState, request: &Request) -> Option<Role> {
    let cookies = request.headers().get(header::COOKIE)?.to_str().ok()?;
    let token = cookies
        .split(';')
        .map(|c| c.trim())
        .find_map(|c| c.strip_prefix(&format!("{SESSION_COOKIE}=")[..]))?;
    state.sessions.lock().unwrap().get(token).copied()
}

/// Layer applied to everything except `/login/*` and `/auth/*`: resolve a
/// role from the session cookie or the auth_key parameters, or reject.
pub async fn require_auth(
    State(state): State<AdminState>,
    Query(params): Query<AuthKeyParams>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let role = session_role(&state, &request).or_else(|| {
        auth_key_valid(&state.config.auth_key, &params.auth_key, params.timestamp)
            .then_some(Role::Admin)
    });

    match role {
        Some(role) => {
            request.extensions_mut().insert(role);
            Ok(next.run(request).await)
        }
        None => Err(StatusCode::UNAUTHORIZED),
    }
}
