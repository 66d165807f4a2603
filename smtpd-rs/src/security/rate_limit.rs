//! Sliding-window rate limiting for mail submission.
//!
//! Two keyed counter families share one map: per remote IP for
//! unauthenticated sessions and per user for authenticated ones. The check
//! runs at MAIL acceptance time, not per connection, so one TCP connection
//! submitting many messages is counted per message.
//!
//! A window entry is `(window_start, count, last_touch)`. The map is guarded
//! by a plain mutex; callers never await while holding it, and the critical
//! section is a handful of instructions.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Key for rate limit tracking
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum LimitKey {
    Ip(IpAddr),
    User(String),
}

impl std::fmt::Display for LimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitKey::Ip(ip) => write!(f, "ip {ip}"),
            LimitKey::User(user) => write!(f, "user {user}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    window_start: Instant,
    count: u64,
    last_touch: Instant,
}

pub struct RateLimiter {
    window: Duration,
    entries: Mutex<HashMap<LimitKey, WindowCounter>>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Check the counter for `key` against `limit` and increment it if the
    /// request is allowed. Denied requests do not consume quota.
    ///
    /// The whole read-modify-write happens under one lock acquisition, so no
    /// interleaving of concurrent callers can observe more than `limit`
    /// successes within a window.
    pub fn check_and_increment(&self, key: LimitKey, limit: u64) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("rate limiter lock poisoned");

        let counter = entries.entry(key.clone()).or_insert(WindowCounter {
            window_start: now,
            count: 0,
            last_touch: now,
        });

        if now.duration_since(counter.window_start) >= self.window {
            counter.window_start = now;
            counter.count = 0;
        }
        counter.last_touch = now;

        if counter.count < limit {
            counter.count += 1;
            true
        } else {
            warn!("rate limit exceeded for {} (limit {})", key, limit);
            false
        }
    }

    /// Current count within the active window, without incrementing.
    pub fn current(&self, key: &LimitKey) -> u64 {
        let now = Instant::now();
        let entries = self.entries.lock().expect("rate limiter lock poisoned");
        match entries.get(key) {
            Some(c) if now.duration_since(c.window_start) < self.window => c.count,
            _ => 0,
        }
    }

    /// Drop entries untouched for longer than twice the window.
    pub fn sweep(&self) {
        let now = Instant::now();
        let horizon = self.window * 2;
        let mut entries = self.entries.lock().expect("rate limiter lock poisoned");
        let before = entries.len();
        entries.retain(|_, c| now.duration_since(c.last_touch) < horizon);
        let removed = before - entries.len();
        if removed > 0 {
            debug!("rate limiter sweep removed {} stale entries", removed);
        }
    }

    /// Background sweep loop; stops when `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => limiter.sweep(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> LimitKey {
        LimitKey::Ip(s.parse().unwrap())
    }

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        for _ in 0..5 {
            assert!(limiter.check_and_increment(ip("192.0.2.1"), 5));
        }
        assert!(!limiter.check_and_increment(ip("192.0.2.1"), 5));
    }

    #[test]
    fn test_denial_does_not_consume_quota() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        for _ in 0..3 {
            limiter.check_and_increment(ip("192.0.2.2"), 3);
        }
        for _ in 0..10 {
            assert!(!limiter.check_and_increment(ip("192.0.2.2"), 3));
        }
        assert_eq!(limiter.current(&ip("192.0.2.2")), 3);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        assert!(limiter.check_and_increment(ip("192.0.2.3"), 1));
        assert!(!limiter.check_and_increment(ip("192.0.2.3"), 1));
        assert!(limiter.check_and_increment(ip("192.0.2.4"), 1));
        assert!(limiter.check_and_increment(LimitKey::User("a@example.com".into()), 1));
    }

    #[test]
    fn test_window_expiry_resets_count() {
        let limiter = RateLimiter::new(Duration::from_millis(10));
        assert!(limiter.check_and_increment(ip("192.0.2.5"), 1));
        assert!(!limiter.check_and_increment(ip("192.0.2.5"), 1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.check_and_increment(ip("192.0.2.5"), 1));
    }

    #[test]
    fn test_sweep_drops_stale_entries() {
        let limiter = RateLimiter::new(Duration::from_millis(5));
        limiter.check_and_increment(ip("192.0.2.6"), 10);
        std::thread::sleep(Duration::from_millis(20));
        limiter.sweep();
        assert_eq!(limiter.entries.lock().unwrap().len(), 0);
    }

    #[test]
    fn test_concurrent_successes_bounded_by_limit() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(60)));
        let limit = 50u64;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            handles.push(std::thread::spawn(move || {
                let mut allowed = 0u64;
                for _ in 0..20 {
                    if limiter.check_and_increment(ip("192.0.2.7"), limit) {
                        allowed += 1;
                    }
                }
                allowed
            }));
        }
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // 8 threads x 20 attempts = 160 attempts against a limit of 50
        assert_eq!(total, limit);
    }
}
