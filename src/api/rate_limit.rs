use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Default window for unauthenticated callers.
pub const DEFAULT_LIMIT: u32 = 60;
pub const WINDOW: Duration = Duration::from_secs(60);

/// Idle windows are dropped on this cadence.
const SWEEP_EVERY: Duration = Duration::from_secs(300);

/// Coarse route grouping: one window per (caller, class).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Purchase,
    Agent,
    Public,
}

impl RouteClass {
    pub fn of_path(path: &str) -> Self {
        if path.starts_with("/api/agents/buy-volume") || path.starts_with("/api/launch") {
            RouteClass::Purchase
        } else if path.starts_with("/api/agent/") {
            RouteClass::Agent
        } else {
            RouteClass::Public
        }
    }
}

/// Sliding 60-second windows keyed by (caller, route class): each request
/// timestamp is kept until it ages out, so a burst cannot double up across
/// a window boundary. Idle callers are swept periodically.
pub struct RateLimiter {
    windows: Mutex<HashMap<(String, RouteClass), VecDeque<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request. Ok carries (limit, remaining) for the response
    /// headers; Err carries seconds until the oldest request ages out.
    pub async fn check(
        &self,
        caller: &str,
        class: RouteClass,
        limit: u32,
    ) -> Result<(u32, u32), u64> {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let window = windows
            .entry((caller.to_string(), class))
            .or_default();

        // Evict timestamps that have slid out of the window.
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) > WINDOW)
        {
            window.pop_front();
        }

        if window.len() >= limit as usize {
            let oldest = window.front().expect("non-empty at the limit");
            let retry = WINDOW.as_secs() - now.duration_since(*oldest).as_secs();
            return Err(retry.max(1));
        }

        window.push_back(now);
        Ok((limit, limit - window.len() as u32))
    }

    pub fn spawn_sweep(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_EVERY).await;
                let now = Instant::now();
                let mut windows = self.windows.lock().await;
                windows.retain(|_, w| {
                    while w.front().is_some_and(|t| now.duration_since(*t) > WINDOW) {
                        w.pop_front();
                    }
                    !w.is_empty()
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn limit_enforced_per_caller_and_class() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            limiter.check("1.2.3.4", RouteClass::Public, 3).await.unwrap();
        }
        assert!(limiter.check("1.2.3.4", RouteClass::Public, 3).await.is_err());

        // Another caller and another class are independent windows.
        assert!(limiter.check("5.6.7.8", RouteClass::Public, 3).await.is_ok());
        assert!(limiter.check("1.2.3.4", RouteClass::Agent, 3).await.is_ok());
    }

    #[tokio::test]
    async fn remaining_counts_down() {
        let limiter = RateLimiter::new();
        let (limit, remaining) = limiter.check("k", RouteClass::Agent, 10).await.unwrap();
        assert_eq!((limit, remaining), (10, 9));
        let (_, remaining) = limiter.check("k", RouteClass::Agent, 10).await.unwrap();
        assert_eq!(remaining, 8);
    }

    #[tokio::test]
    async fn rejection_reports_time_until_a_slot_frees() {
        let limiter = RateLimiter::new();
        limiter.check("b", RouteClass::Public, 1).await.unwrap();
        let retry = limiter.check("b", RouteClass::Public, 1).await.unwrap_err();
        // The slot frees when the first request ages out, within the window.
        assert!(retry >= 1 && retry <= WINDOW.as_secs());
    }

    #[test]
    fn route_classes_partition_the_surface() {
        assert_eq!(RouteClass::of_path("/api/agents/buy-volume"), RouteClass::Purchase);
        assert_eq!(RouteClass::of_path("/api/launch"), RouteClass::Purchase);
        assert_eq!(RouteClass::of_path("/api/agent/keys"), RouteClass::Agent);
        assert_eq!(RouteClass::of_path("/api/eigens"), RouteClass::Public);
        assert_eq!(RouteClass::of_path("/api/health"), RouteClass::Public);
    }
}
