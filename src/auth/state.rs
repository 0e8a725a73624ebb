//! Per-player authentication state machine.
//!
//! Each tracked player has one entry holding the current phase in an
//! atomically-updated slot. Transitions are compare-and-swap operations, so
//! two concurrent submissions for the same player cannot both win a
//! transition — the loser observes the new phase and resolves accordingly.
//! The happy-path authenticated check is a single atomic load: no locks, no
//! I/O.

use crate::auth::models::PlayerId;
use crate::clock::Clock;
use chrono::Duration;
use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicI64, AtomicU8, AtomicU32, Ordering},
    },
};

/// Authentication phase of a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthPhase {
    /// Initial phase; no credentials accepted yet
    Unauthenticated = 0,
    /// Credentials valid, second factor pending
    AwaitingTwoFactor = 1,
    /// Fully authenticated for the session's duration
    Authenticated = 2,
}

impl AuthPhase {
    fn from_u8(value: u8) -> AuthPhase {
        match value {
            1 => AuthPhase::AwaitingTwoFactor,
            2 => AuthPhase::Authenticated,
            _ => AuthPhase::Unauthenticated,
        }
    }
}

/// In-memory authentication state for one player.
#[derive(Debug)]
pub struct PlayerAuthEntry {
    player_id: PlayerId,
    phase: AtomicU8,
    failed_attempts: AtomicU32,
    /// Unix seconds of the last interaction
    last_activity: AtomicI64,
    /// Unix seconds after which the entry may be evicted; 0 while connected
    evict_after: AtomicI64,
}

impl PlayerAuthEntry {
    fn new(player_id: PlayerId, now_secs: i64) -> Self {
        Self {
            player_id,
            phase: AtomicU8::new(AuthPhase::Unauthenticated as u8),
            failed_attempts: AtomicU32::new(0),
            last_activity: AtomicI64::new(now_secs),
            evict_after: AtomicI64::new(0),
        }
    }

    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    pub fn phase(&self) -> AuthPhase {
        AuthPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase() == AuthPhase::Authenticated
    }

    /// Compare-and-swap phase transition. Returns `false` if another caller
    /// moved the phase first.
    pub fn try_transition(&self, from: AuthPhase, to: AuthPhase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Unconditional phase store. Reserved for logout, forced invalidation,
    /// session expiry, and admin force-authentication — the transitions the
    /// machine allows from any state.
    pub fn force_phase(&self, to: AuthPhase) {
        self.phase.store(to as u8, Ordering::SeqCst);
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts.load(Ordering::SeqCst)
    }

    /// Count one failed attempt; returns the new total.
    pub fn record_failure(&self) -> u32 {
        self.failed_attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_failures(&self) {
        self.failed_attempts.store(0, Ordering::SeqCst);
    }

    pub fn last_activity_secs(&self) -> i64 {
        self.last_activity.load(Ordering::SeqCst)
    }

    fn touch(&self, now_secs: i64) {
        self.last_activity.store(now_secs, Ordering::SeqCst);
    }
}

/// Lazily-populated cache of per-player authentication state.
///
/// The engine process is the single writer of this in-memory truth; the
/// durable repository is the tie-breaker on cache miss or restart.
pub struct PlayerStateMap {
    entries: RwLock<HashMap<PlayerId, Arc<PlayerAuthEntry>>>,
    clock: Arc<dyn Clock>,
}

impl PlayerStateMap {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Get or lazily create the entry for a player.
    pub fn entry(&self, player_id: PlayerId) -> Arc<PlayerAuthEntry> {
        let now_secs = self.clock.now().timestamp();

        if let Some(entry) = self.entries.read().expect("state map lock poisoned").get(&player_id)
        {
            entry.touch(now_secs);
            entry.evict_after.store(0, Ordering::SeqCst);
            return Arc::clone(entry);
        }

        let mut entries = self.entries.write().expect("state map lock poisoned");
        let entry = entries
            .entry(player_id)
            .or_insert_with(|| Arc::new(PlayerAuthEntry::new(player_id, now_secs)));
        entry.touch(now_secs);
        Arc::clone(entry)
    }

    /// Entry for a player if one is currently tracked.
    pub fn get(&self, player_id: PlayerId) -> Option<Arc<PlayerAuthEntry>> {
        self.entries
            .read()
            .expect("state map lock poisoned")
            .get(&player_id)
            .cloned()
    }

    /// Cheap happy-path check; never touches storage.
    pub fn is_authenticated(&self, player_id: PlayerId) -> bool {
        self.get(player_id)
            .is_some_and(|entry| entry.is_authenticated())
    }

    /// Start the eviction grace period for a disconnected player. The entry
    /// stays queryable until [`PlayerStateMap::evict_expired`] runs past the
    /// deadline.
    pub fn mark_disconnected(&self, player_id: PlayerId, grace: Duration) {
        if let Some(entry) = self.get(player_id) {
            let deadline = (self.clock.now() + grace).timestamp();
            entry.evict_after.store(deadline, Ordering::SeqCst);
        }
    }

    /// Drop entries whose disconnect grace period has elapsed. Returns how
    /// many were evicted.
    pub fn evict_expired(&self) -> usize {
        let now_secs = self.clock.now().timestamp();
        let mut entries = self.entries.write().expect("state map lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| {
            let deadline = entry.evict_after.load(Ordering::SeqCst);
            deadline == 0 || deadline > now_secs
        });
        before - entries.len()
    }

    /// Drop a player's entry immediately.
    pub fn remove(&self, player_id: PlayerId) {
        self.entries
            .write()
            .expect("state map lock poisoned")
            .remove(&player_id);
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.read().expect("state map lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;
    use uuid::Uuid;

    fn setup() -> (PlayerStateMap, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        (PlayerStateMap::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn entries_start_unauthenticated() {
        let (map, _clock) = setup();
        let entry = map.entry(Uuid::new_v4());
        assert_eq!(entry.phase(), AuthPhase::Unauthenticated);
        assert_eq!(entry.failed_attempts(), 0);
    }

    #[test]
    fn cas_transition_happens_once() {
        let (map, _clock) = setup();
        let entry = map.entry(Uuid::new_v4());
        assert!(entry.try_transition(AuthPhase::Unauthenticated, AuthPhase::Authenticated));
        assert!(!entry.try_transition(AuthPhase::Unauthenticated, AuthPhase::Authenticated));
        assert_eq!(entry.phase(), AuthPhase::Authenticated);
    }

    #[test]
    fn concurrent_transitions_have_one_winner() {
        let (map, _clock) = setup();
        let entry = map.entry(Uuid::new_v4());

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let entry = Arc::clone(&entry);
                    scope.spawn(move || {
                        entry.try_transition(
                            AuthPhase::Unauthenticated,
                            AuthPhase::AwaitingTwoFactor,
                        )
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("worker panicked"))
                .filter(|&won| won)
                .count()
        });

        assert_eq!(winners, 1);
    }

    #[test]
    fn failure_counter_accumulates_and_resets() {
        let (map, _clock) = setup();
        let entry = map.entry(Uuid::new_v4());
        assert_eq!(entry.record_failure(), 1);
        assert_eq!(entry.record_failure(), 2);
        entry.reset_failures();
        assert_eq!(entry.failed_attempts(), 0);
    }

    #[test]
    fn eviction_respects_grace_period() {
        let (map, clock) = setup();
        let player = Uuid::new_v4();
        map.entry(player);

        map.mark_disconnected(player, Duration::seconds(120));
        assert_eq!(map.evict_expired(), 0, "grace period still running");

        clock.advance(Duration::seconds(121));
        assert_eq!(map.evict_expired(), 1);
        assert!(map.get(player).is_none());
    }

    #[test]
    fn reconnect_cancels_pending_eviction() {
        let (map, clock) = setup();
        let player = Uuid::new_v4();
        map.entry(player);
        map.mark_disconnected(player, Duration::seconds(120));

        // Player interacts again before the deadline
        map.entry(player);
        clock.advance(Duration::seconds(200));
        assert_eq!(map.evict_expired(), 0);
        assert!(map.get(player).is_some());
    }
}
