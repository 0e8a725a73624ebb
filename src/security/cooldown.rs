//! Single-value expiring marks used to throttle repeated actions.

use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex, RwLock},
};

/// Per-key cooldown cache.
///
/// `set` records "now"; lookups compare against the configured duration.
/// Entries expire on their own: expired marks are pruned lazily on lookup and
/// by [`CooldownCache::prune`], so the map stays bounded by the set of keys
/// active inside one cooldown window.
pub struct CooldownCache<K> {
    duration: RwLock<Duration>,
    /// Instant at which the cooldown for a key expires
    entries: Mutex<HashMap<K, DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl<K: Eq + Hash + Clone> CooldownCache<K> {
    pub fn new(duration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            duration: RwLock::new(duration),
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Start (or restart) the cooldown for a key.
    pub fn set(&self, key: K) {
        let duration = *self.duration.read().expect("cooldown config lock poisoned");
        let expires_at = self.clock.now() + duration;
        self.entries
            .lock()
            .expect("cooldown lock poisoned")
            .insert(key, expires_at);
    }

    /// Whether the key is still cooling down.
    pub fn is_on_cooldown(&self, key: &K) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock().expect("cooldown lock poisoned");
        match entries.get(key) {
            Some(expires_at) if *expires_at > now => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Remaining cooldown for a key; zero when none is active.
    ///
    /// Non-negative and monotonically decreasing until expiry.
    pub fn remaining(&self, key: &K) -> Duration {
        let now = self.clock.now();
        let entries = self.entries.lock().expect("cooldown lock poisoned");
        match entries.get(key) {
            Some(expires_at) if *expires_at > now => *expires_at - now,
            _ => Duration::zero(),
        }
    }

    /// Drop the cooldown for a key.
    pub fn clear(&self, key: &K) {
        self.entries
            .lock()
            .expect("cooldown lock poisoned")
            .remove(key);
    }

    /// Sweep all expired marks. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().expect("cooldown lock poisoned");
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        before - entries.len()
    }

    /// Apply a new duration to subsequent `set` calls. Existing marks keep
    /// the expiry they were issued with.
    pub fn reconfigure(&self, duration: Duration) {
        *self.duration.write().expect("cooldown config lock poisoned") = duration;
    }
}
