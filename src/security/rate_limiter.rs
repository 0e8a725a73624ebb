//! Windowed attempt counting for abuse-prone actions.

use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex, RwLock},
};

#[derive(Debug, Clone)]
struct WindowCounter {
    count: u32,
    window_start: DateTime<Utc>,
}

/// Fixed-window rate limiter keyed by an opaque identifier.
///
/// Check and increment happen under one lock, so concurrent attempts for the
/// same key cannot all slip past the limit: exactly the first `max_attempts`
/// acquires inside a window succeed, and the caller that crosses the
/// threshold trips the limit for everyone else.
pub struct RateLimiter<K> {
    max_attempts: RwLock<u32>,
    window: RwLock<Duration>,
    counters: Mutex<HashMap<K, WindowCounter>>,
    clock: Arc<dyn Clock>,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    pub fn new(max_attempts: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_attempts: RwLock::new(max_attempts),
            window: RwLock::new(window),
            counters: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Attempt to acquire a permit.
    ///
    /// Returns `true` while the post-increment count stays within the
    /// configured maximum for the current window.
    pub fn try_acquire(&self, key: &K) -> bool {
        let max = *self.max_attempts.read().expect("rate limit config lock poisoned");
        let window = *self.window.read().expect("rate limit config lock poisoned");
        let now = self.clock.now();

        let mut counters = self.counters.lock().expect("rate limit lock poisoned");
        let counter = counters
            .entry(key.clone())
            .or_insert_with(|| WindowCounter {
                count: 0,
                window_start: now,
            });

        if now - counter.window_start >= window {
            counter.count = 0;
            counter.window_start = now;
        }

        counter.count += 1;
        counter.count <= max
    }

    /// Clear the counter for a key (e.g. after a successful login).
    pub fn reset(&self, key: &K) {
        self.counters
            .lock()
            .expect("rate limit lock poisoned")
            .remove(key);
    }

    /// Sweep counters whose window has fully elapsed. Returns how many were
    /// removed.
    pub fn prune(&self) -> usize {
        let window = *self.window.read().expect("rate limit config lock poisoned");
        let now = self.clock.now();
        let mut counters = self.counters.lock().expect("rate limit lock poisoned");
        let before = counters.len();
        counters.retain(|_, counter| now - counter.window_start < window);
        before - counters.len()
    }

    /// Apply a new limit to subsequent acquires without dropping live
    /// counters.
    pub fn reconfigure(&self, max_attempts: u32, window: Duration) {
        *self.max_attempts.write().expect("rate limit config lock poisoned") = max_attempts;
        *self.window.write().expect("rate limit config lock poisoned") = window;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn setup(max: u32, window_secs: i64) -> (Arc<RateLimiter<&'static str>>, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let limiter = RateLimiter::new(max, Duration::seconds(window_secs), Arc::new(clock.clone()));
        (Arc::new(limiter), clock)
    }

    #[test]
    fn exactly_first_n_acquires_succeed() {
        let (limiter, _clock) = setup(3, 60);
        for attempt in 1..=3 {
            assert!(limiter.try_acquire(&"key"), "attempt {attempt} should pass");
        }
        assert!(!limiter.try_acquire(&"key"), "attempt 4 must be limited");
    }

    #[test]
    fn fresh_window_allows_again() {
        let (limiter, clock) = setup(2, 60);
        assert!(limiter.try_acquire(&"key"));
        assert!(limiter.try_acquire(&"key"));
        assert!(!limiter.try_acquire(&"key"));

        clock.advance(Duration::seconds(61));
        assert!(limiter.try_acquire(&"key"));
    }

    #[test]
    fn reset_clears_the_counter() {
        let (limiter, _clock) = setup(1, 60);
        assert!(limiter.try_acquire(&"key"));
        assert!(!limiter.try_acquire(&"key"));
        limiter.reset(&"key");
        assert!(limiter.try_acquire(&"key"));
    }

    #[test]
    fn keys_are_independent() {
        let (limiter, _clock) = setup(1, 60);
        assert!(limiter.try_acquire(&"alice"));
        assert!(!limiter.try_acquire(&"alice"));
        assert!(limiter.try_acquire(&"bob"));
    }

    #[test]
    fn concurrent_acquires_respect_the_cap() {
        let (limiter, _clock) = setup(5, 60);
        let allowed = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let allowed = Arc::clone(&allowed);
                std::thread::spawn(move || {
                    if limiter.try_acquire(&"key") {
                        allowed.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker panicked");
        }

        assert_eq!(allowed.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn prune_drops_stale_windows() {
        let (limiter, clock) = setup(3, 60);
        limiter.try_acquire(&"stale");
        clock.advance(Duration::seconds(61));
        limiter.try_acquire(&"live");
        assert_eq!(limiter.prune(), 1);
    }
}
