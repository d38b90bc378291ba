//! Core rate limiter implementation.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::continuous::ContinuousStrategy;
use super::strategy::{AdmissionStrategy, Strategy};
use super::windowed::WindowedStrategy;
use crate::config::LimiterConfig;
use crate::error::{Result, ValidationError};

/// Capacity substituted for unlimited limiters.
pub const UNLIMITED_MAX_COUNT: u64 = u64::MAX;
/// Refill interval substituted for unlimited limiters.
pub const UNLIMITED_INTERVAL: Duration = Duration::from_millis(1);

/// A single bucket of permits.
///
/// This struct is thread-safe and can be shared across multiple tasks,
/// typically behind an `Arc`. The admission algorithm is chosen at
/// construction and never changes.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use hivemind_ratelimit::RateLimiter;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> hivemind_ratelimit::error::Result<()> {
/// let scope = CancellationToken::new();
/// let limiter = RateLimiter::new(&scope, 5, Duration::from_secs(10))?;
///
/// for _ in 0..10 {
///     limiter.take().await;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    strategy: Box<dyn AdmissionStrategy>,
}

impl RateLimiter {
    /// Create a windowed limiter granting `max_count` permits every `interval`.
    ///
    /// The refill task runs on the current Tokio runtime and is stopped when
    /// `scope` is cancelled.
    pub fn new(scope: &CancellationToken, max_count: u64, interval: Duration) -> Result<Self> {
        validate(max_count, interval)?;
        let strategy = WindowedStrategy::spawn(scope, max_count, interval)?;

        debug!(max_count, interval = ?interval, "Created windowed rate limiter");
        Ok(Self {
            strategy: Box::new(strategy),
        })
    }

    /// Create a windowed limiter with an effectively unbounded capacity.
    pub fn unlimited(scope: &CancellationToken) -> Result<Self> {
        let strategy = WindowedStrategy::spawn(scope, UNLIMITED_MAX_COUNT, UNLIMITED_INTERVAL)?;

        debug!("Created unlimited rate limiter");
        Ok(Self {
            strategy: Box::new(strategy),
        })
    }

    /// Create a leaky bucket limiter accruing `max_count` permits per `interval`.
    ///
    /// No background task is needed, so no cancellation scope is taken.
    pub fn leaky_bucket(max_count: u64, interval: Duration) -> Result<Self> {
        validate(max_count, interval)?;

        debug!(max_count, interval = ?interval, "Created leaky bucket rate limiter");
        Ok(Self {
            strategy: Box::new(ContinuousStrategy::new(max_count, interval)),
        })
    }

    /// Create a limiter from a configuration value.
    ///
    /// Unlimited configurations always use the windowed strategy.
    pub fn from_config(scope: &CancellationToken, config: &LimiterConfig) -> Result<Self> {
        if config.unlimited {
            return Self::unlimited(scope);
        }
        match config.strategy {
            Strategy::Windowed => Self::new(scope, config.max_count, config.duration),
            Strategy::Continuous => Self::leaky_bucket(config.max_count, config.duration),
        }
    }

    /// Take one permit, waiting until one is available.
    ///
    /// On a stopped limiter this never completes; do not call it after
    /// [`stop`](Self::stop).
    pub async fn take(&self) {
        self.strategy.take().await
    }

    /// Check whether a permit appears to be available without consuming it.
    pub fn can_take(&self) -> bool {
        self.strategy.available() > 0
    }

    /// Number of permits that appear to be available right now.
    pub fn available(&self) -> u64 {
        self.strategy.available()
    }

    /// Current maximum permits per interval.
    pub fn limit(&self) -> u64 {
        self.strategy.limit()
    }

    /// Change the maximum permits per interval.
    pub fn set_limit(&self, max_count: u64) -> Result<()> {
        if max_count == 0 {
            return Err(ValidationError::ZeroMaxCount.into());
        }
        self.strategy.set_limit(max_count);
        Ok(())
    }

    /// Current refill interval.
    pub fn interval(&self) -> Duration {
        self.strategy.interval()
    }

    /// Change the refill interval.
    pub fn set_duration(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(ValidationError::ZeroDuration.into());
        }
        self.strategy.set_interval(interval);
        Ok(())
    }

    /// Stop the limiter, releasing its background task if it has one.
    pub fn stop(&self) {
        self.strategy.stop();
    }

    /// Whether the limiter has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.strategy.is_stopped()
    }

    /// The admission algorithm in use.
    pub fn strategy(&self) -> Strategy {
        self.strategy.kind()
    }
}

fn validate(max_count: u64, interval: Duration) -> std::result::Result<(), ValidationError> {
    if max_count == 0 {
        return Err(ValidationError::ZeroMaxCount);
    }
    if interval.is_zero() {
        return Err(ValidationError::ZeroDuration);
    }
    Ok(())
}
