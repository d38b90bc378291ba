//! Admission strategy trait for abstracting the windowed and continuous algorithms.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Admission algorithm used by a [`RateLimiter`](super::RateLimiter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// The permit count is reset to the maximum at every refill interval.
    #[default]
    Windowed,
    /// Permits accrue continuously over elapsed time (leaky bucket).
    #[serde(alias = "leakybucket", alias = "leaky_bucket")]
    Continuous,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Windowed => f.write_str("windowed"),
            Strategy::Continuous => f.write_str("continuous"),
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "windowed" => Ok(Strategy::Windowed),
            "continuous" | "leakybucket" | "leaky_bucket" | "leaky-bucket" => {
                Ok(Strategy::Continuous)
            }
            other => Err(format!("unknown strategy: {}", other)),
        }
    }
}

/// Trait for admission algorithms.
///
/// Both implementations expose the same operation set so that a
/// [`RateLimiter`](super::RateLimiter) can hold either one. Values passed to
/// the setters have already been validated by the limiter.
#[async_trait]
pub trait AdmissionStrategy: Send + Sync + fmt::Debug {
    /// Which algorithm this is.
    fn kind(&self) -> Strategy;

    /// Wait until a permit is granted and consume it.
    async fn take(&self);

    /// Number of permits that appear to be available right now.
    ///
    /// This is a hint only and never consumes a permit.
    fn available(&self) -> u64;

    /// Current maximum permits per interval.
    fn limit(&self) -> u64;

    /// Change the maximum permits per interval.
    fn set_limit(&self, max_count: u64);

    /// Current refill interval.
    fn interval(&self) -> Duration;

    /// Change the refill interval.
    fn set_interval(&self, interval: Duration);

    /// Release any background activity held by the strategy.
    fn stop(&self);

    /// Whether `stop` has been called.
    fn is_stopped(&self) -> bool;
}
