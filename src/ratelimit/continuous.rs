//! Continuous (leaky bucket) admission computed from elapsed time.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{self, Instant};

use super::strategy::{AdmissionStrategy, Strategy};

/// Token balance of a leaky bucket.
#[derive(Debug)]
struct Bucket {
    /// Accrued tokens as of `updated`; negative while reservations are outstanding
    tokens: f64,
    /// When `tokens` was last brought up to date
    updated: Instant,
    /// Burst capacity
    burst: u64,
    /// Period over which `burst` tokens accrue
    interval: Duration,
}

impl Bucket {
    /// Tokens accrued per second.
    fn rate(&self) -> f64 {
        self.burst as f64 / self.interval.as_secs_f64()
    }

    fn tokens_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        (self.tokens + elapsed * self.rate()).min(self.burst as f64)
    }

    fn advance(&mut self, now: Instant) {
        self.tokens = self.tokens_at(now);
        self.updated = now;
    }

    /// Reserve one token and return how long the caller must wait for it.
    fn reserve(&mut self, now: Instant) -> Duration {
        self.advance(now);
        self.tokens -= 1.0;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-self.tokens / self.rate()).unwrap_or(Duration::MAX)
        }
    }

    /// Give back a token whose wait was abandoned.
    fn refund(&mut self, now: Instant) {
        self.advance(now);
        self.tokens = (self.tokens + 1.0).min(self.burst as f64);
    }
}

/// A token reserved by a waiting `take`.
///
/// Returned to the bucket if dropped before the wait completes.
struct Reservation<'a> {
    bucket: &'a Mutex<Bucket>,
    settled: bool,
}

impl Reservation<'_> {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.bucket.lock().refund(Instant::now());
        }
    }
}

/// Accrues `max_count / interval` permits per second up to a burst of `max_count`.
///
/// There is no background task; waiting callers sleep for exactly the time
/// their reservation needs. The bucket starts full.
#[derive(Debug)]
pub struct ContinuousStrategy {
    bucket: Mutex<Bucket>,
}

impl ContinuousStrategy {
    /// Create a full bucket.
    pub fn new(max_count: u64, interval: Duration) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: max_count as f64,
                updated: Instant::now(),
                burst: max_count,
                interval,
            }),
        }
    }
}

#[async_trait]
impl AdmissionStrategy for ContinuousStrategy {
    fn kind(&self) -> Strategy {
        Strategy::Continuous
    }

    async fn take(&self) {
        let wait = self.bucket.lock().reserve(Instant::now());
        if wait.is_zero() {
            return;
        }

        let reservation = Reservation {
            bucket: &self.bucket,
            settled: false,
        };
        time::sleep(wait).await;
        reservation.settle();
    }

    fn available(&self) -> u64 {
        let tokens = self.bucket.lock().tokens_at(Instant::now());
        if tokens < 1.0 {
            0
        } else {
            tokens.floor() as u64
        }
    }

    fn limit(&self) -> u64 {
        self.bucket.lock().burst
    }

    fn set_limit(&self, max_count: u64) {
        let mut bucket = self.bucket.lock();
        bucket.advance(Instant::now());
        bucket.burst = max_count;
        bucket.tokens = bucket.tokens.min(max_count as f64);
    }

    fn interval(&self) -> Duration {
        self.bucket.lock().interval
    }

    fn set_interval(&self, interval: Duration) {
        let mut bucket = self.bucket.lock();
        bucket.advance(Instant::now());
        bucket.interval = interval;
    }

    fn stop(&self) {}

    fn is_stopped(&self) -> bool {
        false
    }
}
