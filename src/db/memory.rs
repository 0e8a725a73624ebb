//! Fully in-memory repository backend.
//!
//! Implements every repository trait over one shared store. Nothing here
//! survives a restart, which makes it the wrong choice for production hosts
//! but the right substrate for tests and throwaway servers — the whole
//! engine runs against it without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use super::{
    DbError, DbResult,
    repository::{
        AccountRepository, AuditRepository, BanRepository, Repositories, SessionRepository,
        TwoFactorRepository,
    },
};
use crate::antibot::{BanState, IpBanRecord};
use crate::audit::{AuditEntry, AuditEvent};
use crate::auth::models::{AccountRecord, PlayerId};
use crate::session::Session;
use crate::twofa::TwoFactorRecord;

#[derive(Default)]
struct Stores {
    accounts: HashMap<PlayerId, AccountRecord>,
    sessions: HashMap<String, Session>,
    two_factor: HashMap<PlayerId, TwoFactorRecord>,
    bans: HashMap<String, IpBanRecord>,
    audit: Vec<AuditEntry>,
}

/// Shared in-memory store implementing all repository traits.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Stores>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Package this backend as a full repository bundle.
    pub fn into_repositories(self) -> Repositories {
        Repositories {
            accounts: Arc::new(self.clone()),
            sessions: Arc::new(self.clone()),
            two_factor: Arc::new(self.clone()),
            bans: Arc::new(self.clone()),
            audit: Arc::new(self),
        }
    }

    /// Snapshot of every audit entry written so far, oldest first. Test
    /// support; the engine itself reads through [`AuditRepository`].
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().expect("memory store lock poisoned").audit.clone()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Stores) -> R) -> R {
        let mut stores = self.inner.lock().expect("memory store lock poisoned");
        f(&mut stores)
    }
}

fn ban_is_active(record: &IpBanRecord, now: DateTime<Utc>) -> bool {
    match &record.state {
        BanState::Permanent => true,
        BanState::Temp { expires_at } => *expires_at > now,
        BanState::None => false,
    }
}

#[async_trait]
impl AccountRepository for MemoryBackend {
    async fn find_by_player_id(&self, player_id: PlayerId) -> DbResult<Option<AccountRecord>> {
        Ok(self.with(|s| s.accounts.get(&player_id).cloned()))
    }

    async fn find_by_username(&self, username: &str) -> DbResult<Option<AccountRecord>> {
        Ok(self.with(|s| {
            s.accounts
                .values()
                .find(|a| a.username.eq_ignore_ascii_case(username))
                .cloned()
        }))
    }

    async fn insert(&self, record: &AccountRecord) -> DbResult<()> {
        self.with(|s| {
            if s.accounts.contains_key(&record.player_id) {
                return Err(DbError::Conflict(format!(
                    "account already exists for {}",
                    record.player_id
                )));
            }
            s.accounts.insert(record.player_id, record.clone());
            Ok(())
        })
    }

    async fn update_password_hash(&self, player_id: PlayerId, password_hash: &str) -> DbResult<()> {
        self.with(|s| {
            if let Some(account) = s.accounts.get_mut(&player_id) {
                account.password_hash = password_hash.to_string();
            }
        });
        Ok(())
    }

    async fn update_last_login(
        &self,
        player_id: PlayerId,
        at: DateTime<Utc>,
        ip: &str,
    ) -> DbResult<()> {
        self.with(|s| {
            if let Some(account) = s.accounts.get_mut(&player_id) {
                account.last_login_at = Some(at);
                account.last_login_ip = Some(ip.to_string());
            }
        });
        Ok(())
    }

    async fn count(&self) -> DbResult<u64> {
        Ok(self.with(|s| s.accounts.len() as u64))
    }

    async fn delete(&self, player_id: PlayerId) -> DbResult<()> {
        self.with(|s| {
            s.accounts.remove(&player_id);
        });
        Ok(())
    }
}

#[async_trait]
impl SessionRepository for MemoryBackend {
    async fn find_active(&self, binding: &str, now: DateTime<Utc>) -> DbResult<Option<Session>> {
        Ok(self.with(|s| {
            s.sessions
                .get(binding)
                .filter(|session| !session.is_expired(now))
                .cloned()
        }))
    }

    async fn upsert(&self, session: &Session) -> DbResult<()> {
        self.with(|s| {
            s.sessions.insert(session.binding.clone(), session.clone());
        });
        Ok(())
    }

    async fn delete_for_binding(&self, binding: &str) -> DbResult<()> {
        self.with(|s| {
            s.sessions.remove(binding);
        });
        Ok(())
    }

    async fn delete_for_player(&self, player_id: PlayerId) -> DbResult<()> {
        self.with(|s| {
            s.sessions.retain(|_, session| session.player_id != player_id);
        });
        Ok(())
    }

    async fn count_active(&self, now: DateTime<Utc>) -> DbResult<u64> {
        Ok(self.with(|s| {
            s.sessions
                .values()
                .filter(|session| !session.is_expired(now))
                .count() as u64
        }))
    }
}

#[async_trait]
impl TwoFactorRepository for MemoryBackend {
    async fn find(&self, player_id: PlayerId) -> DbResult<Option<TwoFactorRecord>> {
        Ok(self.with(|s| s.two_factor.get(&player_id).cloned()))
    }

    async fn upsert(&self, record: &TwoFactorRecord) -> DbResult<()> {
        self.with(|s| {
            s.two_factor.insert(record.player_id, record.clone());
        });
        Ok(())
    }

    async fn delete(&self, player_id: PlayerId) -> DbResult<()> {
        self.with(|s| {
            s.two_factor.remove(&player_id);
        });
        Ok(())
    }
}

#[async_trait]
impl BanRepository for MemoryBackend {
    async fn find(&self, ip: &str) -> DbResult<Option<IpBanRecord>> {
        Ok(self.with(|s| s.bans.get(ip).cloned()))
    }

    async fn upsert(&self, record: &IpBanRecord) -> DbResult<()> {
        self.with(|s| {
            if record.state == BanState::None {
                s.bans.remove(&record.ip);
            } else {
                s.bans.insert(record.ip.clone(), record.clone());
            }
        });
        Ok(())
    }

    async fn delete(&self, ip: &str) -> DbResult<()> {
        self.with(|s| {
            s.bans.remove(ip);
        });
        Ok(())
    }

    async fn list_active(&self, now: DateTime<Utc>) -> DbResult<Vec<IpBanRecord>> {
        let mut active: Vec<IpBanRecord> = self.with(|s| {
            s.bans
                .values()
                .filter(|record| ban_is_active(record, now))
                .cloned()
                .collect()
        });
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(active)
    }

    async fn count_active(&self, now: DateTime<Utc>) -> DbResult<u64> {
        Ok(self.with(|s| {
            s.bans
                .values()
                .filter(|record| ban_is_active(record, now))
                .count() as u64
        }))
    }
}

#[async_trait]
impl AuditRepository for MemoryBackend {
    async fn append(&self, entry: &AuditEntry) -> DbResult<()> {
        self.with(|s| s.audit.push(entry.clone()));
        Ok(())
    }

    async fn history_for(&self, player_id: PlayerId) -> DbResult<Vec<AuditEntry>> {
        let mut entries: Vec<AuditEntry> = self.with(|s| {
            s.audit
                .iter()
                .rev()
                .filter(|entry| entry.player_id == Some(player_id))
                .cloned()
                .collect()
        });
        // Stable sort keeps reverse-insertion order for equal timestamps
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    async fn count_events_since(&self, event: AuditEvent, since: DateTime<Utc>) -> DbResult<u64> {
        Ok(self.with(|s| {
            s.audit
                .iter()
                .filter(|entry| entry.event == event && entry.created_at >= since)
                .count() as u64
        }))
    }
}
