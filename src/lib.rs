//! Hivemind Ratelimit - in-process admission control
//!
//! This crate throttles callers to a configured number of permits per time
//! interval. A [`RateLimiter`] guards a single bucket using either a windowed
//! refill or a continuous leaky bucket. [`MultiLimiter`] and [`AutoLimiter`]
//! map string keys to independent limiters, the latter creating limiters on
//! first use and rebuilding stopped ones from remembered settings.
//!
//! Background refill tasks run on the Tokio runtime and are bound to a
//! [`CancellationToken`] scope supplied by the caller.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod registry;

pub use config::{KeyOptions, LimiterConfig, RegistryConfig};
pub use error::{LimiterError, ValidationError};
pub use ratelimit::{RateLimiter, Strategy};
pub use registry::{AutoLimiter, MultiLimiter};
pub use tokio_util::sync::CancellationToken;
