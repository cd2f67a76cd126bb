//! Per-tunnel/host target pool: the live target list, round-robin cursor
//! and the set of targets currently removed by agent health reports.

use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
#[error("all targets are offline")]
pub struct NoTarget;

#[derive(Debug, Default)]
struct PoolState {
    live: Vec<String>,
    removed: Vec<String>,
    cursor: usize,
}

/// Target list derived from a newline-separated spec string. Health reports
/// move entries between the live list and the removed list; selection walks
/// the live list round-robin.
#[derive(Debug)]
pub struct TargetPool {
    raw: String,
    pub local_proxy: bool,
    state: Mutex<PoolState>,
}

impl TargetPool {
    pub fn new(spec: &str, local_proxy: bool) -> Self {
        let live = split_spec(spec);
        Self {
            raw: spec.to_string(),
            local_proxy,
            state: Mutex::new(PoolState {
                live,
                removed: Vec::new(),
                cursor: 0,
            }),
        }
    }

    /// The raw newline-separated spec the pool was built from.
    pub fn spec(&self) -> &str {
        &self.raw
    }

    pub fn contains_target(&self, target: &str) -> bool {
        self.raw
            .split('\n')
            .any(|t| !t.trim().is_empty() && t.trim().contains(target))
    }

    /// Round-robin selection over the live list. Fails when health reports
    /// removed every target.
    pub fn select(&self) -> Result<String, NoTarget> {
        let mut st = self.state.lock().unwrap();
        if st.live.is_empty() {
            return Err(NoTarget);
        }
        if st.cursor >= st.live.len() {
            st.cursor = 0;
        }
        let picked = st.live[st.cursor].clone();
        st.cursor += 1;
        Ok(picked)
    }

    /// Health report `status=false`: drop the target from the live list.
    pub fn mark_failed(&self, target: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(pos) = st.live.iter().position(|t| t == target) {
            st.live.remove(pos);
            st.removed.push(target.to_string());
        }
    }

    /// Health report `status=true`: return a previously removed target.
    pub fn mark_recovered(&self, target: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(pos) = st.removed.iter().position(|t| t == target) {
            st.removed.remove(pos);
            if !st.live.iter().any(|t| t == target) {
                st.live.push(target.to_string());
            }
        }
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }
}

fn split_spec(spec: &str) -> Vec<String> {
    spec.split('\n')
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_through_targets() {
        let pool = TargetPool::new("a:1\nb:2\nc:3", false);
        let picks: Vec<String> = (0..6).map(|_| pool.select().unwrap()).collect();
        assert_eq!(picks, ["a:1", "b:2", "c:3", "a:1", "b:2", "c:3"]);
    }

    #[test]
    fn failed_target_is_never_selected() {
        let pool = TargetPool::new("10.0.0.1:22\n10.0.0.2:22", false);
        pool.mark_failed("10.0.0.1:22");
        for _ in 0..10 {
            assert_eq!(pool.select().unwrap(), "10.0.0.2:22");
        }
    }

    #[test]
    fn recovered_target_returns_to_rotation() {
        let pool = TargetPool::new("10.0.0.1:22\n10.0.0.2:22", false);
        pool.mark_failed("10.0.0.1:22");
        pool.mark_recovered("10.0.0.1:22");
        let picks: Vec<String> = (0..4).map(|_| pool.select().unwrap()).collect();
        assert!(picks.contains(&"10.0.0.1:22".to_string()));
    }

    #[test]
    fn all_targets_removed_fails_selection() {
        let pool = TargetPool::new("a:1", false);
        pool.mark_failed("a:1");
        assert_eq!(pool.select(), Err(NoTarget));
    }

    #[test]
    fn repeated_failure_reports_are_idempotent() {
        let pool = TargetPool::new("a:1\nb:2", false);
        pool.mark_failed("a:1");
        pool.mark_failed("a:1");
        pool.mark_recovered("a:1");
        assert_eq!(pool.live_count(), 2);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let pool = TargetPool::new("a:1\n\n  \nb:2\n", false);
        assert_eq!(pool.live_count(), 2);
    }
}
