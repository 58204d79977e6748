//! Rate limiting middleware.
//!
//! In-memory fixed-window admission control per caller key (the client IP for HTTP traffic).
//! Runs before any authentication work. Budgets are process-local and vanish on restart.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::config::RateLimitConfig;
use crate::pipeline::RequestPipeline;

const SHARDS: usize = 16;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

struct Window {
    count: u32,
    started: Instant,
}

/// Fixed-window limiter.
///
/// The first admitted request for a key opens a window; at most `max_requests` are admitted
/// until it closes. Rejections do not consume budget. Check-and-increment happens under the
/// key's shard lock, so concurrent callers on one key never push the count past the limit.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    shards: Arc<Vec<Mutex<HashMap<String, Window>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let shards = (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            config,
            shards: Arc::new(shards),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn allow(&self, key: &str) -> RateDecision {
        self.allow_at(key, Instant::now())
    }

    /// Check against an explicit clock reading.
    pub fn allow_at(&self, key: &str, now: Instant) -> RateDecision {
        if !self.config.enabled {
            return RateDecision::Allowed {
                remaining: self.config.max_requests,
            };
        }

        let mut shard = self.shard(key).lock();
        let window = shard.entry(key.to_string()).or_insert(Window {
            count: 0,
            started: now,
        });

        // Reset window if expired
        if now.saturating_duration_since(window.started) >= self.config.window {
            window.count = 0;
            window.started = now;
        }

        if window.count >= self.config.max_requests {
            let resets_at = window.started + self.config.window;
            return RateDecision::Limited {
                retry_after: resets_at.saturating_duration_since(now),
            };
        }

        window.count += 1;
        RateDecision::Allowed {
            remaining: self.config.max_requests - window.count,
        }
    }

    /// Drop windows idle for two window lengths. Call from a background task.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let horizon = self.config.window * 2;
        self.shards
            .iter()
            .map(|shard| {
                let mut shard = shard.lock();
                let before = shard.len();
                shard.retain(|_, window| now.saturating_duration_since(window.started) < horizon);
                before - shard.len()
            })
            .sum()
    }

    pub fn tracked_keys(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Window>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }
}

/// Rate limiting middleware function.
pub async fn rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(pipeline): State<Arc<RequestPipeline>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = addr.ip().to_string();

    match pipeline.admit(&ip) {
        Ok(()) => next.run(request).await,
        Err(rejection) => {
            warn!(ip = %ip, path = %request.uri().path(), "Rate limit exceeded");
            rejection.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window: Duration) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            enabled: true,
            max_requests,
            window,
        })
    }

    #[test]
    fn test_rate_limit_allows_under_limit() {
        let limiter = limiter(10, Duration::from_secs(60));

        for expected_remaining in (0..10).rev() {
            assert_eq!(
                limiter.allow("127.0.0.1"),
                RateDecision::Allowed {
                    remaining: expected_remaining
                }
            );
        }
    }

    #[test]
    fn test_sixth_request_in_window_rejected_then_window_resets() {
        let limiter = limiter(5, Duration::from_secs(1));
        let start = Instant::now();

        for i in 0..5 {
            assert!(limiter
                .allow_at("K", start + Duration::from_millis(i * 10))
                .is_allowed());
        }

        match limiter.allow_at("K", start + Duration::from_millis(400)) {
            RateDecision::Limited { retry_after } => {
                assert_eq!(retry_after, Duration::from_millis(600));
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        assert!(limiter
            .allow_at("K", start + Duration::from_secs(1))
            .is_allowed());
    }

    #[test]
    fn test_rejections_do_not_extend_the_window() {
        let limiter = limiter(1, Duration::from_secs(1));
        let start = Instant::now();

        assert!(limiter.allow_at("K", start).is_allowed());
        for ms in [100, 500, 900] {
            assert!(!limiter
                .allow_at("K", start + Duration::from_millis(ms))
                .is_allowed());
        }
        assert!(limiter
            .allow_at("K", start + Duration::from_millis(1000))
            .is_allowed());
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(1, Duration::from_secs(60));

        assert!(limiter.allow("10.0.0.1").is_allowed());
        assert!(!limiter.allow("10.0.0.1").is_allowed());
        assert!(limiter.allow("10.0.0.2").is_allowed());
    }

    #[test]
    fn test_disabled_limiter_admits_everything() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: false,
            max_requests: 1,
            window: Duration::from_secs(60),
        });

        for _ in 0..100 {
            assert!(limiter.allow("K").is_allowed());
        }
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_exact_limit_under_contention() {
        let limiter = limiter(25, Duration::from_secs(60));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| limiter.allow("shared").is_allowed())
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 25);
    }

    #[test]
    fn test_sweep_drops_idle_windows() {
        let limiter = limiter(5, Duration::from_secs(1));
        let start = Instant::now();

        limiter.allow_at("old", start);
        limiter.allow_at("fresh", start + Duration::from_millis(1500));
        assert_eq!(limiter.tracked_keys(), 2);

        let removed = limiter.sweep_at(start + Duration::from_millis(2500));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
