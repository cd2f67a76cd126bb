//! Health probe scheduler.
//!
//! The agent is the prober in this protocol; the server only ingests
//! results. This module replicates the agent-side state machine so both
//! ends of the interop contract live in one tree: a min-heap orders the
//! next-check deadlines, probes are TCP-connect or a plain HTTP GET
//! expecting 200, and reports flow through a [`HealthReporter`] sink in the
//! `(target, status)` shape the signal connection carries.

use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

/// Where probe results go; the real agent sends them up the signal
/// connection as `target *#* ("0"|"1")`.
#[async_trait]
pub trait HealthReporter: Send + Sync {
    async fn report(&self, target: &str, healthy: bool);
}

/// One probe configuration covering a comma-separated target list.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Comma-separated `ip:port` targets.
    pub targets: String,
    /// "tcp" or "http".
    pub check_type: String,
    /// Path appended to the target for http probes.
    pub url: String,
    pub timeout: Duration,
    pub interval: Duration,
    pub max_fail: u32,
}

impl HealthCheck {
    fn schedulable(&self) -> bool {
        self.max_fail > 0 && !self.timeout.is_zero() && !self.interval.is_zero()
    }
}

struct CheckState {
    check: HealthCheck,
    /// Consecutive failures per target.
    fail_counts: HashMap<String, u32>,
}

/// Min-heap driven scheduler over a set of health checks.
pub struct HealthScheduler {
    checks: Vec<CheckState>,
}

impl HealthScheduler {
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        Self {
            checks: checks
                .into_iter()
                .filter(HealthCheck::schedulable)
                .map(|check| CheckState {
                    check,
                    fail_counts: HashMap::new(),
                })
                .collect(),
        }
    }

    /// Run until dropped. Each expiry probes every target of that check and
    /// pushes the next deadline back onto the heap.
    pub async fn run(mut self, reporter: Arc<dyn HealthReporter>) {
        let mut heap: BinaryHeap<Reverse<(Instant, usize)>> = BinaryHeap::new();
        let now = Instant::now();
        for (idx, st) in self.checks.iter().enumerate() {
            heap.push(Reverse((now + st.check.interval, idx)));
        }

        while let Some(Reverse((deadline, idx))) = heap.pop() {
            tokio::time::sleep_until(deadline).await;
            self.run_check(idx, reporter.as_ref()).await;
            let interval = self.checks[idx].check.interval;
            heap.push(Reverse((Instant::now() + interval, idx)));
        }
    }

    async fn run_check(&mut self, idx: usize, reporter: &dyn HealthReporter) {
        let check = self.checks[idx].check.clone();
        for target in check.targets.split(',') {
            let target = target.trim();
            if target.is_empty() {
                continue;
            }
            let healthy = probe(&check, target).await;
            let fails = self.checks[idx]
                .fail_counts
                .entry(target.to_string())
                .or_insert(0);
            if !healthy {
                *fails += 1;
                // report at max_fail and at every further multiple
                if *fails % check.max_fail == 0 {
                    debug!(probe = %target, fails = *fails, "probe failed, reporting down");
                    reporter.report(target, false).await;
                }
            } else if *fails >= check.max_fail {
                debug!(probe = %target, "probe recovered, reporting up");
                reporter.report(target, true).await;
                *fails = 0;
            } else {
                *fails = 0;
            }
        }
    }
}

async fn probe(check: &HealthCheck, target: &str) -> bool {
    if check.check_type == "tcp" {
        return tokio::time::timeout(check.timeout, TcpStream::connect(target))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
    }
    tokio::time::timeout(check.timeout, http_probe(target, &check.url))
        .await
        .unwrap_or(false)
}

/// Minimal GET that only cares whether the status line says 200.
async fn http_probe(target: &str, url: &str) -> bool {
    let Ok(mut stream) = TcpStream::connect(target).await else {
        return false;
    };
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        if url.is_empty() { "/" } else { url },
        target
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }
    let mut head = [0u8; 64];
    let Ok(n) = stream.read(&mut head).await else {
        return false;
    };
    String::from_utf8_lossy(&head[..n])
        .lines()
        .next()
        .map(|line| line.contains(" 200"))
        .unwrap_or(false)
}
