//! Response cache for the HTTP vhost proxy.
//!
//! Capacity-bounded map keyed by `host + uri`; when full the oldest entry
//! is evicted. Entries hold the full serialized response and are written
//! back verbatim.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub struct HttpCache {
    inner: Mutex<CacheState>,
    capacity: usize,
}

struct CacheState {
    entries: HashMap<String, Bytes>,
    order: VecDeque<String>,
}

impl HttpCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.inner.lock().unwrap().entries.get(key).cloned()
    }

    pub fn insert(&self, key: String, response: Bytes) {
        let mut state = self.inner.lock().unwrap();
        if !state.entries.contains_key(&key) {
            state.order.push_back(key.clone());
        }
        state.entries.insert(key, response);
        while state.order.len() > self.capacity {
            if let Some(evicted) = state.order.pop_front() {
                state.entries.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache key: `host + uri`, uri already starting with `/`.
pub fn cache_key(host: &str, uri: &str) -> String {
    format!("{host}{uri}")
}

/// The static-asset heuristic: only URIs with a `.` in them are cached.
pub fn cacheable_uri(uri: &str) -> bool {
    uri.contains('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_returns_entries() {
        let cache = HttpCache::new(4);
        cache.insert(cache_key("a.com", "/img.png"), Bytes::from("response"));
        assert_eq!(cache.get("a.com/img.png"), Some(Bytes::from("response")));
        assert_eq!(cache.get("a.com/other.png"), None);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let cache = HttpCache::new(2);
        cache.insert("k1".into(), Bytes::from("1"));
        cache.insert("k2".into(), Bytes::from("2"));
        cache.insert("k3".into(), Bytes::from("3"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("k1").is_none());
        assert!(cache.get("k3").is_some());
    }

    #[test]
    fn overwrite_does_not_grow_order() {
        let cache = HttpCache::new(2);
        cache.insert("k1".into(), Bytes::from("1"));
        cache.insert("k1".into(), Bytes::from("1b"));
        cache.insert("k2".into(), Bytes::from("2"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("k1"), Some(Bytes::from("1b")));
    }

    #[test]
    fn asset_heuristic() {
        assert!(cacheable_uri("/img.png"));
        assert!(!cacheable_uri("/api/users"));
    }
}
