//! Session lifecycle management.
//!
//! A session means "this player does not need to re-enter credentials right
//! now". Sessions are keyed by an opaque binding string (player + normalized
//! source IP in the shipped policy, see [`Session::binding_for`]), persisted
//! through the session repository, and mirrored in an in-memory cache for the
//! reconnect fast path. Expiry is always checked against the injected clock —
//! cache hits are never trusted without a fresh expiry comparison.

use crate::{
    auth::models::PlayerId,
    clock::Clock,
    config::SessionConfig,
    db::{DbError, SessionRepository},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] DbError),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// An issued session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub player_id: PlayerId,
    /// Opaque token identifying this issuance
    pub token: Uuid,
    /// Binding key the session is scoped to
    pub binding: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Source IP at issuance, when known
    pub ip: Option<String>,
}

impl Session {
    /// Compose the shipped binding policy: player id + normalized source IP.
    ///
    /// Callers with a different policy (device fingerprints, player-only) can
    /// pass any other opaque string to the service; the mechanism does not
    /// inspect the binding's composition.
    pub fn binding_for(player_id: PlayerId, ip: &str) -> String {
        format!("{}@{}", player_id, crate::antibot::normalize_ip(ip))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Issues, validates, refreshes, and destroys sessions.
pub struct SessionService {
    repo: Arc<dyn SessionRepository>,
    clock: Arc<dyn Clock>,
    config: std::sync::RwLock<SessionConfig>,
    /// Binding -> session, write-through over the repository
    cache: RwLock<HashMap<String, Session>>,
}

impl SessionService {
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        Self {
            repo,
            clock,
            config: std::sync::RwLock::new(config),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Issue a new session for a binding, replacing any prior session for
    /// the same binding.
    ///
    /// # Errors
    ///
    /// * `SessionError::Database` - the session row could not be persisted
    pub async fn issue(
        &self,
        player_id: PlayerId,
        binding: String,
        ip: Option<String>,
    ) -> SessionResult<Session> {
        let lifetime = self.lifetime();
        let now = self.clock.now();
        let session = Session {
            player_id,
            token: Uuid::new_v4(),
            binding: binding.clone(),
            issued_at: now,
            expires_at: now + lifetime,
            ip,
        };

        self.repo.upsert(&session).await?;
        self.cache.write().await.insert(binding, session.clone());
        Ok(session)
    }

    /// Resolve a binding to a live session, or `None` if the caller must
    /// re-authenticate.
    ///
    /// A cached session past its expiry is discarded from both cache and
    /// repository; a cache miss falls through to the repository, which
    /// enforces expiry on its side as well.
    pub async fn validate(&self, binding: &str) -> SessionResult<Option<Session>> {
        let now = self.clock.now();

        let cached = self.cache.read().await.get(binding).cloned();
        if let Some(session) = cached {
            if !session.is_expired(now) {
                return Ok(Some(session));
            }
            self.cache.write().await.remove(binding);
            self.repo.delete_for_binding(binding).await?;
            return Ok(None);
        }

        match self.repo.find_active(binding, now).await? {
            Some(session) => {
                self.cache
                    .write()
                    .await
                    .insert(binding.to_string(), session.clone());
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Destroy all sessions for a player, across every binding.
    pub async fn invalidate(&self, player_id: PlayerId) -> SessionResult<()> {
        self.repo.delete_for_player(player_id).await?;
        self.cache
            .write()
            .await
            .retain(|_, session| session.player_id != player_id);
        Ok(())
    }

    /// Extend a session's expiry, but only inside the configured renewal
    /// window; outside it the session is returned unchanged. Bounds lifetime
    /// extension so a busy player cannot keep one session alive forever.
    ///
    /// # Errors
    ///
    /// * `SessionError::Database` - the extended row could not be persisted
    pub async fn refresh_if_eligible(&self, session: &Session) -> SessionResult<Session> {
        let (lifetime, renewal_window) = {
            let config = self.config.read().expect("session config lock poisoned");
            (
                Duration::seconds(config.lifetime_secs as i64),
                Duration::seconds(config.renewal_window_secs as i64),
            )
        };
        let now = self.clock.now();

        if session.is_expired(now) || session.expires_at - now > renewal_window {
            return Ok(session.clone());
        }

        let mut refreshed = session.clone();
        refreshed.expires_at = now + lifetime;
        self.repo.upsert(&refreshed).await?;
        self.cache
            .write()
            .await
            .insert(refreshed.binding.clone(), refreshed.clone());
        Ok(refreshed)
    }

    /// Count sessions that have not yet expired.
    pub async fn active_count(&self) -> SessionResult<u64> {
        Ok(self.repo.count_active(self.clock.now()).await?)
    }

    /// Drop expired sessions from the in-memory cache.
    pub async fn prune_cache(&self) -> usize {
        let now = self.clock.now();
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, session| !session.is_expired(now));
        before - cache.len()
    }

    /// Apply new lifetime policy without touching live sessions.
    pub fn reconfigure(&self, config: SessionConfig) {
        *self.config.write().expect("session config lock poisoned") = config;
    }

    fn lifetime(&self) -> Duration {
        let config = self.config.read().expect("session config lock poisoned");
        Duration::seconds(config.lifetime_secs as i64)
    }
}
