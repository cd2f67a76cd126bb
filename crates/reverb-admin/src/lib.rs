//! Admin HTTP surface.
//!
//! Form-encoded POST endpoints returning `{code, msg, data}` JSON. Two ways
//! in: a session cookie established by form login, or `auth_key` +
//! `timestamp` query parameters where `auth_key == md5(secret + timestamp)`
//! within a 20 second window. Admin sees everything; an agent logging in
//! with its own web credentials only sees and edits its own records.

pub mod auth;
pub mod handlers;
pub mod models;

use reverb_bridge::Bridge;
use reverb_store::Store;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub use auth::Role;

/// Lifecycle operations the admin surface triggers on the proxy supervisor.
#[async_trait::async_trait]
pub trait TaskControl: Send + Sync {
    async fn start_tunnel(&self, id: i32) -> Result<(), String>;
    async fn stop_tunnel(&self, id: i32) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub username: String,
    pub password: String,
    /// Shared secret for the md5(auth_key + timestamp) scheme.
    pub auth_key: String,
    /// 16-char key used to encrypt `auth_key` for distribution.
    pub auth_crypt_key: String,
    /// Bridge info surfaced on /status/info.
    pub bridge_port: u16,
}

#[derive(Clone)]
pub struct AdminState {
    pub store: Arc<Store>,
    pub bridge: Arc<Bridge>,
    pub control: Arc<dyn TaskControl>,
    pub config: AdminConfig,
    pub sessions: Arc<Mutex<HashMap<String, Role>>>,
}

impl AdminState {
    pub fn new(
        store: Arc<Store>,
        bridge: Arc<Bridge>,
        control: Arc<dyn TaskControl>,
        config: AdminConfig,
    ) -> Self {
        Self {
            store,
            bridge,
            control,
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Build the full admin router.
pub fn build_router(state: AdminState) -> axum::Router {
    handlers::router(state)
}
