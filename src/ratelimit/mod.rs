//! Single-bucket rate limiting and its admission strategies.

mod continuous;
mod limiter;
mod strategy;
mod windowed;

pub use continuous::ContinuousStrategy;
pub use limiter::{RateLimiter, UNLIMITED_INTERVAL, UNLIMITED_MAX_COUNT};
pub use strategy::{AdmissionStrategy, Strategy};
pub use windowed::WindowedStrategy;
