//! Token-bucket rate limiting, shared per agent.
//!
//! The bucket holds up to 2× the per-second refill so short bursts pass, and
//! a background task tops it up once a second. `consume` blocks on a 100 ms
//! poll until enough tokens are available; [`RateStream`] applies that to any
//! byte stream, charging both directions.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Default agent rate when none is configured: 16 MiB/s.
pub const DEFAULT_RATE: i64 = 16 << 20;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct RateLimiter {
    capacity: i64,
    refill_per_sec: i64,
    tokens: AtomicI64,
}

impl RateLimiter {
    /// Create a limiter refilling `rate_per_sec` tokens each second. The
    /// refill task stops once every handle is dropped.
    pub fn new(rate_per_sec: i64) -> Arc<Self> {
        let rate = rate_per_sec.max(1);
        let limiter = Arc::new(Self {
            capacity: rate * 2,
            refill_per_sec: rate,
            tokens: AtomicI64::new(0),
        });
        let weak: Weak<Self> = Arc::downgrade(&limiter);
        tokio::spawn(async move {
            let period = Duration::from_secs(1);
            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match weak.upgrade() {
                    Some(l) => l.refill(),
                    None => break,
                }
            }
        });
        limiter
    }

    fn refill(&self) {
        let tokens = self.tokens.load(Ordering::Acquire);
        let headroom = self.capacity - tokens;
        let add = headroom.min(self.refill_per_sec).max(0);
        if add > 0 {
            self.tokens.fetch_add(add, Ordering::AcqRel);
        }
    }

    /// Take `n` tokens if available right now.
    pub fn try_consume(&self, n: i64) -> bool {
        let mut cur = self.tokens.load(Ordering::Acquire);
        loop {
            if cur < n {
                return false;
            }
            match self.tokens.compare_exchange_weak(
                cur,
                cur - n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Block until `n` tokens are available, polling every 100 ms.
    pub async fn consume(&self, n: i64) {
        if self.try_consume(n) {
            return;
        }
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            if self.try_consume(n) {
                return;
            }
        }
    }

    /// Give tokens back, e.g. when a charged operation was cancelled.
    pub fn return_tokens(&self, n: i64) {
        let tokens = self.tokens.load(Ordering::Acquire);
        let add = (self.capacity - tokens).min(n).max(0);
        if add > 0 {
            self.tokens.fetch_add(add, Ordering::AcqRel);
        }
    }

    pub fn available(&self) -> i64 {
        self.tokens.load(Ordering::Acquire)
    }
}

/// Wraps any byte stream and charges the limiter for bytes moved in either
/// direction. Each direction carries a debt from its last transfer and pays
/// it before moving more data, so sustained throughput converges on the
/// configured rate.
pub struct RateStream<S> {
    inner: S,
    limiter: Option<Arc<RateLimiter>>,
    read_debt: i64,
    write_debt: i64,
    read_delay: Option<Pin<Box<Sleep>>>,
    write_delay: Option<Pin<Box<Sleep>>>,
}

impl<S> RateStream<S> {
    pub fn new(inner: S, limiter: Option<Arc<RateLimiter>>) -> Self {
        Self {
            inner,
            limiter,
            read_debt: 0,
            write_debt: 0,
            read_delay: None,
            write_delay: None,
        }
    }
}

fn poll_pay_debt(
    limiter: &Option<Arc<RateLimiter>>,
    debt: &mut i64,
    delay: &mut Option<Pin<Box<Sleep>>>,
    cx: &mut Context<'_>,
) -> Poll<()> {
    let Some(limiter) = limiter else {
        *debt = 0;
        return Poll::Ready(());
    };
    loop {
        if *debt <= 0 {
            return Poll::Ready(());
        }
        // pay in installments no larger than one refill, so a debt bigger
        // than the bucket can still drain
        let step = (*debt).min(limiter.refill_per_sec);
        if limiter.try_consume(step) {
            *debt -= step;
            continue;
        }
        if delay.is_none() {
            *delay = Some(Box::pin(tokio::time::sleep(POLL_INTERVAL)));
        }
        match delay.as_mut().unwrap().as_mut().poll(cx) {
            Poll::Ready(()) => {
                *delay = None;
            }
            Poll::Pending => return Poll::Pending,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RateStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match poll_pay_debt(&this.limiter, &mut this.read_debt, &mut this.read_delay, cx) {
            Poll::Ready(()) => {}
            Poll::Pending => return Poll::Pending,
        }
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.read_debt = (buf.filled().len() - before) as i64;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RateStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match poll_pay_debt(&this.limiter, &mut this.write_debt, &mut this.write_delay, cx) {
            Poll::Ready(()) => {}
            Poll::Pending => return Poll::Pending,
        }
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.write_debt = n as i64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn consume_waits_for_refill() {
        let limiter = RateLimiter::new(1024);
        assert!(!limiter.try_consume(512));

        let start = tokio::time::Instant::now();
        limiter.consume(512).await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn transfer_is_paced_by_the_bucket() {
        // 1 KiB/s: moving 10 KiB must take at least ~9 seconds
        let limiter = RateLimiter::new(1024);
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut tx = a;
        let mut rx = RateStream::new(b, Some(limiter));

        let payload = vec![1u8; 10 * 1024];
        let writer = tokio::spawn(async move {
            tx.write_all(&payload).await.unwrap();
            drop(tx);
        });

        let start = tokio::time::Instant::now();
        let mut out = Vec::new();
        rx.read_to_end(&mut out).await.unwrap();
        writer.await.unwrap();

        assert_eq!(out.len(), 10 * 1024);
        assert!(start.elapsed() >= Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn return_tokens_restores_the_bucket() {
        let limiter = RateLimiter::new(1024);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(limiter.try_consume(1024));
        assert_eq!(limiter.available(), 0);
        limiter.return_tokens(1024);
        assert_eq!(limiter.available(), 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_never_exceeds_capacity() {
        let limiter = RateLimiter::new(100);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(limiter.available() <= 200);
    }
}
