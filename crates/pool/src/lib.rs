//! Servprobe Pool - concurrent execution of match requests
//!
//! Wraps a shared [`Matcher`](servprobe_engine::Matcher) in a fixed set of
//! workers. Results reach registered callbacks in completion order, not
//! submission order.

mod pool;
mod progress;
mod rate_limiter;

pub use pool::{Pool, PoolCallback, Task};
pub use progress::{PoolStats, ProgressTracker};
pub use rate_limiter::RateLimiter;
