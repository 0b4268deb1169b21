//! Request-start rate limiting

use governor::{DefaultDirectRateLimiter, Quota};
use std::num::NonZeroU32;

/// Caps how many match requests start per second across all workers.
pub struct RateLimiter {
    inner: DefaultDirectRateLimiter,
}

impl RateLimiter {
    /// `None` when `requests_per_second` is zero, meaning unlimited.
    pub fn new(requests_per_second: u32) -> Option<Self> {
        let rate = NonZeroU32::new(requests_per_second)?;
        Some(Self {
            inner: governor::RateLimiter::direct(Quota::per_second(rate)),
        })
    }

    /// Wait until one more request may start.
    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}
