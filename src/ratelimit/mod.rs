//! Rate limiting logic and state management.

mod bucket;
mod limiter;
mod reaper;
mod registry;

pub use bucket::{BucketMetrics, TokenBucket};
pub use limiter::{LimiterConfig, RateLimiter};
pub use reaper::Reaper;
pub use registry::ClientRegistry;
