//! Keyed registries of rate limiters.

mod auto;
mod multi;
mod slots;

pub use auto::AutoLimiter;
pub use multi::MultiLimiter;
