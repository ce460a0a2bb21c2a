//! Sliding-window rate limiting for outbound fetches.
//!
//! Limiters are shared, externally-synchronized resources: concurrent callers
//! may acquire from the same limiter, and the registry hands out the same
//! instance for the same `(resource_kind, account)` key.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// At most `max_permits` acquisitions per sliding `window`.
pub struct RateLimiter {
    max_permits: usize,
    window: Duration,
    recent: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_permits: usize, window: Duration) -> Self {
        Self {
            max_permits: max_permits.max(1),
            window,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until a permit is available, then take it. Waiting here is
    /// ordinary latency; callers' time budgets keep running.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut recent = self.recent.lock().await;
                while recent
                    .front()
                    .is_some_and(|issued| issued.elapsed() >= self.window)
                {
                    recent.pop_front();
                }
                if recent.len() < self.max_permits {
                    recent.push_back(Instant::now());
                    None
                } else {
                    // Sleep until the oldest permit leaves the window.
                    let oldest = recent.front().copied();
                    oldest.map(|issued| {
                        self.window
                            .checked_sub(issued.elapsed())
                            .unwrap_or(Duration::ZERO)
                    })
                }
            };

            match wait {
                None => return,
                Some(duration) => tokio::time::sleep(duration).await,
            }
        }
    }
}

/// Explicit registry of limiters keyed by `(resource_kind, account)`,
/// constructed at startup and passed by reference into fetch calls.
#[derive(Default)]
pub struct RateLimiterRegistry {
    limiters: DashMap<(String, String), Arc<RateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        resource_kind: impl Into<String>,
        account: impl Into<String>,
        limiter: RateLimiter,
    ) {
        self.limiters
            .insert((resource_kind.into(), account.into()), Arc::new(limiter));
    }

    pub fn get(&self, resource_kind: &str, account: &str) -> Option<Arc<RateLimiter>> {
        self.limiters
            .get(&(resource_kind.to_string(), account.to_string()))
            .map(|entry| entry.clone())
    }

    pub fn get_or_insert(
        &self,
        resource_kind: &str,
        account: &str,
        max_permits: usize,
        window: Duration,
    ) -> Arc<RateLimiter> {
        self.limiters
            .entry((resource_kind.to_string(), account.to_string()))
            .or_insert_with(|| Arc::new(RateLimiter::new(max_permits, window)))
            .clone()
    }
}
