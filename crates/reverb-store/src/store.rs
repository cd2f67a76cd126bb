//! The repository: concurrent maps of agents, tunnels and hosts with the
//! lookups the bridge and proxy fabric run on every flow.
//!
//! Reads take a shared lock on the map and clone the `Arc`; mutations insert
//! or remove whole records. Cross-record invariants (unique verify key,
//! unique secret password, unique vhost tuple) are checked by scanning at
//! create/update time, accepting the narrow race for the low write rate.

use crate::entities::{Agent, AgentProfile, Host, HostScheme, Tunnel, TunnelMode};
use rand::Rng;
use reverb_proto::md5_hex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("agent is disabled")]
    AgentDisabled,

    #[error("{0}")]
    Duplicate(String),

    #[error("{0}")]
    InvalidInput(String),
}

/// Paging/search/sort parameters for list endpoints.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub start: usize,
    pub length: usize,
    pub search: String,
    /// `id`, `inlet_flow` or `export_flow`.
    pub sort: String,
    /// `asc` or `desc`.
    pub order: String,
    /// Restrict to one agent; 0 means no restriction.
    pub agent_id: i32,
}

pub struct Store {
    agents: RwLock<HashMap<i32, Arc<Agent>>>,
    tunnels: RwLock<HashMap<i32, Arc<Tunnel>>>,
    hosts: RwLock<HashMap<i32, Arc<Host>>>,
    next_agent_id: AtomicI32,
    next_tunnel_id: AtomicI32,
    next_host_id: AtomicI32,
}

impl Store {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            tunnels: RwLock::new(HashMap::new()),
            hosts: RwLock::new(HashMap::new()),
            next_agent_id: AtomicI32::new(0),
            next_tunnel_id: AtomicI32::new(0),
            next_host_id: AtomicI32::new(0),
        }
    }

    pub fn alloc_agent_id(&self) -> i32 {
        self.next_agent_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn alloc_tunnel_id(&self) -> i32 {
        self.next_tunnel_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn alloc_host_id(&self) -> i32 {
        self.next_host_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn bump_seed(counter: &AtomicI32, id: i32) {
        let mut cur = counter.load(Ordering::SeqCst);
        while id > cur {
            match counter.compare_exchange(cur, id, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    // ---- agents ----

    pub fn get_agent(&self, id: i32) -> Result<Arc<Agent>, StoreError> {
        self.agents
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    /// Resolve the 32-char md5 digest an agent presents during the
    /// handshake. Records the peer IP and refuses disabled agents.
    pub fn find_agent_by_verify_key(
        &self,
        digest: &str,
        peer_addr: &str,
    ) -> Result<Arc<Agent>, StoreError> {
        let agent = self.find_agent_by_md5_verify_key(digest)?;
        if !agent.enabled() {
            return Err(StoreError::AgentDisabled);
        }
        agent.set_addr(ip_of(peer_addr));
        Ok(agent)
    }

    /// Digest lookup without liveness side effects, used by the public
    /// config channel's STATUS query.
    pub fn find_agent_by_md5_verify_key(&self, digest: &str) -> Result<Arc<Agent>, StoreError> {
        self.agents
            .read()
            .unwrap()
            .values()
            .find(|a| md5_hex(&a.verify_key) == digest)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    pub fn list_agents(&self, q: &ListQuery) -> (Vec<Arc<Agent>>, usize) {
        let mut all: Vec<Arc<Agent>> = self
            .agents
            .read()
            .unwrap()
            .values()
            .filter(|a| !a.profile().no_display)
            .filter(|a| q.agent_id == 0 || a.id == q.agent_id)
            .filter(|a| {
                q.search.is_empty()
                    || a.id.to_string() == q.search
                    || a.verify_key.contains(&q.search)
                    || a.profile().remark.contains(&q.search)
            })
            .cloned()
            .collect();

        sort_agents(&mut all, &q.sort, &q.order);
        let total = all.len();
        let page = page_slice(all, q.start, q.length);
        (page, total)
    }

    /// Create an agent; an empty verify key gets a random 16-char one.
    pub fn create_agent(
        &self,
        mut verify_key: String,
        profile: AgentProfile,
    ) -> Result<Arc<Agent>, StoreError> {
        if !profile.web_username.is_empty() && !self.web_username_free(&profile.web_username, 0) {
            return Err(StoreError::Duplicate(
                "web login username duplicate, please reset".into(),
            ));
        }
        let generated = verify_key.is_empty();
        loop {
            if verify_key.is_empty() {
                verify_key = random_verify_key();
            }
            if self.verify_key_free(&verify_key, 0) {
                break;
            }
            if !generated {
                return Err(StoreError::Duplicate("verify key duplicate".into()));
            }
            verify_key.clear();
        }

        let id = self.alloc_agent_id();
        let agent = Arc::new(Agent::new(id, verify_key, profile));
        self.agents.write().unwrap().insert(id, agent.clone());
        info!(agent_id = id, "agent created");
        Ok(agent)
    }

    /// Insert an agent with a caller-chosen id (catalog load); seeds the id
    /// counter.
    pub fn insert_agent(&self, agent: Arc<Agent>) {
        Self::bump_seed(&self.next_agent_id, agent.id);
        self.agents.write().unwrap().insert(agent.id, agent);
    }

    pub fn update_agent(&self, id: i32, profile: AgentProfile) -> Result<(), StoreError> {
        if !profile.web_username.is_empty() && !self.web_username_free(&profile.web_username, id) {
            return Err(StoreError::Duplicate(
                "web login username duplicate, please reset".into(),
            ));
        }
        let agent = self.get_agent(id)?;
        agent.set_profile(profile);
        Ok(())
    }

    pub fn delete_agent(&self, id: i32) -> Result<(), StoreError> {
        self.agents
            .write()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)?;
        // owned records go with the owner
        self.tunnels
            .write()
            .unwrap()
            .retain(|_, t| t.agent_id != id);
        self.hosts.write().unwrap().retain(|_, h| h.agent_id != id);
        info!(agent_id = id, "agent deleted");
        Ok(())
    }

    pub fn is_public_agent(&self, id: i32) -> bool {
        self.get_agent(id)
            .map(|a| a.profile().no_display)
            .unwrap_or(false)
    }

    fn verify_key_free(&self, vk: &str, except: i32) -> bool {
        !self
            .agents
            .read()
            .unwrap()
            .values()
            .any(|a| a.verify_key == vk && a.id != except)
    }

    fn web_username_free(&self, name: &str, except: i32) -> bool {
        !self
            .agents
            .read()
            .unwrap()
            .values()
            .any(|a| a.profile().web_username == name && a.id != except)
    }

    pub fn agent_by_web_login(&self, username: &str, password: &str) -> Option<Arc<Agent>> {
        self.agents
            .read()
            .unwrap()
            .values()
            .find(|a| {
                let p = a.profile();
                !p.web_username.is_empty() && p.web_username == username && p.web_password == password
            })
            .cloned()
    }

    // ---- tunnels ----

    pub fn get_tunnel(&self, id: i32) -> Result<Arc<Tunnel>, StoreError> {
        self.tunnels
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    pub fn create_tunnel(&self, tunnel: Tunnel) -> Result<Arc<Tunnel>, StoreError> {
        if tunnel.mode.is_listenerless() {
            let dup = self.tunnels.read().unwrap().values().any(|t| {
                t.mode.is_listenerless() && t.password == tunnel.password && t.id != tunnel.id
            });
            if dup {
                return Err(StoreError::Duplicate(format!(
                    "secret mode key {} must be unique",
                    tunnel.password
                )));
            }
        }
        // agent tunnel quota
        if let Ok(agent) = self.get_agent(tunnel.agent_id) {
            let max = agent.profile().max_tunnels;
            if max > 0 && self.tunnels_for_agent(tunnel.agent_id).len() as i32 >= max {
                return Err(StoreError::InvalidInput("tunnel quota exceeded".into()));
            }
        }
        Self::bump_seed(&self.next_tunnel_id, tunnel.id);
        let id = tunnel.id;
        let tunnel = Arc::new(tunnel);
        self.tunnels.write().unwrap().insert(id, tunnel.clone());
        Ok(tunnel)
    }

    pub fn update_tunnel(&self, tunnel: Tunnel) -> Result<Arc<Tunnel>, StoreError> {
        if !self.tunnels.read().unwrap().contains_key(&tunnel.id) {
            return Err(StoreError::NotFound);
        }
        let id = tunnel.id;
        let tunnel = Arc::new(tunnel);
        self.tunnels.write().unwrap().insert(id, tunnel.clone());
        Ok(tunnel)
    }

    pub fn delete_tunnel(&self, id: i32) -> Result<(), StoreError> {
        self.tunnels
            .write()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    pub fn list_tunnels(&self, q: &ListQuery) -> (Vec<Arc<Tunnel>>, usize) {
        let mut all: Vec<Arc<Tunnel>> = self
            .tunnels
            .read()
            .unwrap()
            .values()
            .filter(|t| q.agent_id == 0 || t.agent_id == q.agent_id)
            .filter(|t| {
                q.search.is_empty()
                    || t.id.to_string() == q.search
                    || t.remark.contains(&q.search)
                    || t.port.to_string() == q.search
            })
            .cloned()
            .collect();
        all.sort_by_key(|t| t.id);
        let total = all.len();
        (page_slice(all, q.start, q.length), total)
    }

    pub fn tunnels_for_agent(&self, agent_id: i32) -> Vec<Arc<Tunnel>> {
        self.tunnels
            .read()
            .unwrap()
            .values()
            .filter(|t| t.agent_id == agent_id)
            .cloned()
            .collect()
    }

    /// Resolve the md5 digest presented by SECRET/P2P work channels.
    pub fn get_tunnel_by_md5_password(&self, digest: &str) -> Option<Arc<Tunnel>> {
        self.tunnels
            .read()
            .unwrap()
            .values()
            .find(|t| !t.password.is_empty() && md5_hex(&t.password) == digest)
            .cloned()
    }

    pub fn agent_has_tunnel_on_port(&self, agent_id: i32, port: u16) -> bool {
        port != 0
            && self
                .tunnels
                .read()
                .unwrap()
                .values()
                .any(|t| t.agent_id == agent_id && t.port == port)
    }

    // ---- hosts ----

    pub fn get_host(&self, id: i32) -> Result<Arc<Host>, StoreError> {
        self.hosts
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    pub fn create_host(&self, host: Host) -> Result<Arc<Host>, StoreError> {
        if self.host_rule_exists(&host) {
            return Err(StoreError::Duplicate("host rule already exists".into()));
        }
        Self::bump_seed(&self.next_host_id, host.id);
        let id = host.id;
        let host = Arc::new(host);
        self.hosts.write().unwrap().insert(id, host.clone());
        Ok(host)
    }

    pub fn update_host(&self, host: Host) -> Result<Arc<Host>, StoreError> {
        if !self.hosts.read().unwrap().contains_key(&host.id) {
            return Err(StoreError::NotFound);
        }
        if self.host_rule_exists(&host) {
            return Err(StoreError::Duplicate("host rule already exists".into()));
        }
        let id = host.id;
        let host = Arc::new(host);
        self.hosts.write().unwrap().insert(id, host.clone());
        Ok(host)
    }

    pub fn delete_host(&self, id: i32) -> Result<(), StoreError> {
        self.hosts
            .write()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    pub fn list_hosts(&self, q: &ListQuery) -> (Vec<Arc<Host>>, usize) {
        let mut all: Vec<Arc<Host>> = self
            .hosts
            .read()
            .unwrap()
            .values()
            .filter(|h| q.agent_id == 0 || h.agent_id == q.agent_id)
            .filter(|h| {
                q.search.is_empty()
                    || h.id.to_string() == q.search
                    || h.host.contains(&q.search)
                    || h.remark.contains(&q.search)
            })
            .cloned()
            .collect();
        all.sort_by_key(|h| h.id);
        let total = all.len();
        (page_slice(all, q.start, q.length), total)
    }

    pub fn hosts_for_agent(&self, agent_id: i32) -> Vec<Arc<Host>> {
        self.hosts
            .read()
            .unwrap()
            .values()
            .filter(|h| h.agent_id == agent_id)
            .cloned()
            .collect()
    }

    fn host_rule_exists(&self, host: &Host) -> bool {
        self.hosts.read().unwrap().values().any(|v| {
            v.id != host.id
                && v.host == host.host
                && v.location == host.location
                && v.scheme.conflicts(&host.scheme)
        })
    }

    /// Find the best host rule for an incoming request: scheme filter, then
    /// exact/wildcard name match, then longest location prefix wins.
    pub fn resolve_host(
        &self,
        request_host: &str,
        scheme: &str,
        uri: &str,
    ) -> Result<Arc<Host>, StoreError> {
        let name = ip_of(request_host);
        let candidates: Vec<Arc<Host>> = self
            .hosts
            .read()
            .unwrap()
            .values()
            .filter(|h| h.enabled())
            .filter(|h| h.scheme.matches(scheme))
            .filter(|h| h.matches_host(name))
            .cloned()
            .collect();

        candidates
            .into_iter()
            .filter(|h| uri.starts_with(&h.location))
            .max_by_key(|h| h.location.len())
            .ok_or(StoreError::NotFound)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip a `:port` suffix, leaving bare names and IPv6 literals alone.
pub fn ip_of(addr: &str) -> &str {
    match addr.rfind(':') {
        Some(idx) if addr[idx + 1..].chars().all(|c| c.is_ascii_digit()) => &addr[..idx],
        _ => addr,
    }
}

fn random_verify_key() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

fn page_slice<T>(all: Vec<T>, start: usize, length: usize) -> Vec<T> {
    if length == 0 {
        return all;
    }
    all.into_iter().skip(start).take(length).collect()
}

fn sort_agents(list: &mut [Arc<Agent>], sort: &str, order: &str) {
    match sort {
        "inlet_flow" => list.sort_by_key(|a| a.flow.inlet()),
        "export_flow" => list.sort_by_key(|a| a.flow.export()),
        _ => list.sort_by_key(|a| a.id),
    }
    if order == "desc" {
        list.reverse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{HostScheme, TunnelMode};

    fn store_with_agent() -> (Store, Arc<Agent>) {
        let store = Store::new();
        let agent = store
            .create_agent("aaaaaaaaaaaaaaaa".into(), AgentProfile::default())
            .unwrap();
        (store, agent)
    }

    #[tokio::test]
    async fn verify_key_lookup_uses_md5_digest() {
        let (store, agent) = store_with_agent();
        let digest = md5_hex("aaaaaaaaaaaaaaaa");
        let found = store
            .find_agent_by_verify_key(&digest, "9.8.7.6:1234")
            .unwrap();
        assert_eq!(found.id, agent.id);
        assert_eq!(found.addr(), "9.8.7.6");
    }

    #[tokio::test]
    async fn disabled_agent_fails_verification() {
        let (store, agent) = store_with_agent();
        let mut p = agent.profile();
        p.enabled = false;
        agent.set_profile(p);
        let digest = md5_hex("aaaaaaaaaaaaaaaa");
        assert!(matches!(
            store.find_agent_by_verify_key(&digest, "1.1.1.1:1"),
            Err(StoreError::AgentDisabled)
        ));
    }

    #[tokio::test]
    async fn duplicate_verify_key_is_rejected() {
        let (store, _agent) = store_with_agent();
        assert!(matches!(
            store.create_agent("aaaaaaaaaaaaaaaa".into(), AgentProfile::default()),
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn empty_verify_key_gets_generated() {
        let store = Store::new();
        let agent = store
            .create_agent(String::new(), AgentProfile::default())
            .unwrap();
        assert_eq!(agent.verify_key.len(), 16);
    }

    #[tokio::test]
    async fn secret_password_must_be_unique() {
        let (store, agent) = store_with_agent();
        let mut t1 = Tunnel::new(store.alloc_tunnel_id(), agent.id, TunnelMode::Secret, 0, "", "127.0.0.1:22", false);
        t1.password = "pw".into();
        store.create_tunnel(t1).unwrap();

        let mut t2 = Tunnel::new(store.alloc_tunnel_id(), agent.id, TunnelMode::P2p, 0, "", "127.0.0.1:22", false);
        t2.password = "pw".into();
        assert!(matches!(
            store.create_tunnel(t2),
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn tunnel_password_digest_lookup() {
        let (store, agent) = store_with_agent();
        let mut t = Tunnel::new(store.alloc_tunnel_id(), agent.id, TunnelMode::Secret, 0, "", "x:1", false);
        t.password = "open sesame".into();
        store.create_tunnel(t).unwrap();

        let found = store.get_tunnel_by_md5_password(&md5_hex("open sesame"));
        assert!(found.is_some());
        assert!(store.get_tunnel_by_md5_password(&md5_hex("wrong")).is_none());
    }

    #[tokio::test]
    async fn resolve_host_prefers_longest_location() {
        let (store, agent) = store_with_agent();
        store
            .create_host(Host::new(store.alloc_host_id(), agent.id, "a.com", "/", HostScheme::All, "t:1"))
            .unwrap();
        store
            .create_host(Host::new(store.alloc_host_id(), agent.id, "a.com", "/api", HostScheme::All, "t:2"))
            .unwrap();

        let h = store.resolve_host("a.com", "http", "/api/x").unwrap();
        assert_eq!(h.location, "/api");
        let h = store.resolve_host("a.com", "http", "/index.html").unwrap();
        assert_eq!(h.location, "/");
    }

    #[tokio::test]
    async fn resolve_host_filters_by_scheme_and_wildcard() {
        let (store, agent) = store_with_agent();
        store
            .create_host(Host::new(store.alloc_host_id(), agent.id, "*.a.com", "/", HostScheme::Https, "t:1"))
            .unwrap();

        assert!(store.resolve_host("x.a.com", "https", "/").is_ok());
        assert!(store.resolve_host("x.a.com", "http", "/").is_err());
        assert!(store.resolve_host("a.com", "https", "/").is_err());
        // port on the request host is ignored
        assert!(store.resolve_host("y.a.com:443", "https", "/").is_ok());
    }

    #[tokio::test]
    async fn conflicting_host_rules_are_rejected() {
        let (store, agent) = store_with_agent();
        store
            .create_host(Host::new(store.alloc_host_id(), agent.id, "a.com", "/", HostScheme::All, "t:1"))
            .unwrap();
        assert!(store
            .create_host(Host::new(store.alloc_host_id(), agent.id, "a.com", "/", HostScheme::Http, "t:2"))
            .is_err());
        // different location is fine
        assert!(store
            .create_host(Host::new(store.alloc_host_id(), agent.id, "a.com", "/api", HostScheme::Http, "t:3"))
            .is_ok());
    }

    #[tokio::test]
    async fn deleting_agent_removes_owned_records() {
        let (store, agent) = store_with_agent();
        let t = Tunnel::new(store.alloc_tunnel_id(), agent.id, TunnelMode::Tcp, 7777, "", "x:1", false);
        store.create_tunnel(t).unwrap();
        store
            .create_host(Host::new(store.alloc_host_id(), agent.id, "a.com", "/", HostScheme::All, "t:1"))
            .unwrap();

        store.delete_agent(agent.id).unwrap();
        assert!(store.tunnels_for_agent(agent.id).is_empty());
        assert!(store.hosts_for_agent(agent.id).is_empty());
    }

    #[tokio::test]
    async fn agent_list_sorts_and_pages() {
        let store = Store::new();
        for i in 0..5 {
            let a = store
                .create_agent(format!("key{i}AAAAAAAAAAAA"), AgentProfile::default())
                .unwrap();
            a.flow.add(i as i64 * 100, 0);
        }
        let (page, total) = store.list_agents(&ListQuery {
            start: 0,
            length: 2,
            sort: "inlet_flow".into(),
            order: "desc".into(),
            ..Default::default()
        });
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert!(page[0].flow.inlet() >= page[1].flow.inlet());
    }
}
