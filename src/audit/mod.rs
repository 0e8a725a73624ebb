//! Durable, asynchronous audit trail of security events.
//!
//! Callers enqueue and continue; a dedicated writer task performs the
//! durable append. Auditing is best-effort with respect to the action that
//! triggered it: a full queue drops the entry with an operational log line,
//! and writer failures are logged, never propagated. Entry timestamps are
//! captured at enqueue so they reflect the observed event, not the eventual
//! write.

use crate::{
    auth::models::PlayerId,
    clock::Clock,
    db::{AccountRepository, AuditRepository, BanRepository, DbError, SessionRepository},
};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// Audit errors (read path only; the write path never propagates)
#[derive(Debug, Error)]
pub enum AuditError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] DbError),
}

/// Result type for audit queries
pub type AuditResult<T> = Result<T, AuditError>;

/// Security event kinds recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEvent {
    LoginSuccess,
    LoginFailure,
    Register,
    PasswordChange,
    PasswordReset,
    ForceLogin,
    SessionResume,
    IpBan,
    IpUnban,
    TwoFactorEnroll,
    TwoFactorDisable,
    TwoFactorFailure,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::LoginSuccess => "login_success",
            AuditEvent::LoginFailure => "login_failure",
            AuditEvent::Register => "register",
            AuditEvent::PasswordChange => "password_change",
            AuditEvent::PasswordReset => "password_reset",
            AuditEvent::ForceLogin => "force_login",
            AuditEvent::SessionResume => "session_resume",
            AuditEvent::IpBan => "ip_ban",
            AuditEvent::IpUnban => "ip_unban",
            AuditEvent::TwoFactorEnroll => "2fa_enroll",
            AuditEvent::TwoFactorDisable => "2fa_disable",
            AuditEvent::TwoFactorFailure => "2fa_failure",
        }
    }

    /// Inverse of [`AuditEvent::as_str`], for rows loaded from storage.
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "login_success" => AuditEvent::LoginSuccess,
            "login_failure" => AuditEvent::LoginFailure,
            "register" => AuditEvent::Register,
            "password_change" => AuditEvent::PasswordChange,
            "password_reset" => AuditEvent::PasswordReset,
            "force_login" => AuditEvent::ForceLogin,
            "session_resume" => AuditEvent::SessionResume,
            "ip_ban" => AuditEvent::IpBan,
            "ip_unban" => AuditEvent::IpUnban,
            "2fa_enroll" => AuditEvent::TwoFactorEnroll,
            "2fa_disable" => AuditEvent::TwoFactorDisable,
            "2fa_failure" => AuditEvent::TwoFactorFailure,
            _ => return None,
        })
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one security event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub event: AuditEvent,
    /// Absent for events not tied to a player (e.g. IP bans)
    pub player_id: Option<PlayerId>,
    /// Player name snapshot at the time of the event
    pub username: Option<String>,
    pub ip: String,
    pub detail: String,
    /// Time the event was observed, not the time of the durable write
    pub created_at: DateTime<Utc>,
}

/// Aggregate security statistics, computed from the durable source of truth
/// at query time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthStats {
    pub online_players: usize,
    pub total_players: u64,
    pub active_sessions: u64,
    pub active_bans: u64,
    pub failures_last_hour: u64,
    pub registrations_today: u64,
}

enum WriterMessage {
    Record(Box<AuditEntry>),
    Shutdown,
}

/// Append-only audit log with an asynchronous write path and admin read
/// queries.
#[derive(Clone)]
pub struct AuditLogService {
    tx: mpsc::Sender<WriterMessage>,
    audit_repo: Arc<dyn AuditRepository>,
    accounts: Arc<dyn AccountRepository>,
    sessions: Arc<dyn SessionRepository>,
    bans: Arc<dyn BanRepository>,
    clock: Arc<dyn Clock>,
    writer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AuditLogService {
    /// Spawn the writer task and return the service handle. Must be called
    /// from within a tokio runtime.
    pub fn new(
        audit_repo: Arc<dyn AuditRepository>,
        accounts: Arc<dyn AccountRepository>,
        sessions: Arc<dyn SessionRepository>,
        bans: Arc<dyn BanRepository>,
        clock: Arc<dyn Clock>,
        queue_capacity: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel(queue_capacity.max(1));
        let writer_repo = Arc::clone(&audit_repo);
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    WriterMessage::Record(entry) => {
                        if let Err(e) = writer_repo.append(&entry).await {
                            log::warn!("audit write failed for {}: {}", entry.event, e);
                        }
                    }
                    WriterMessage::Shutdown => break,
                }
            }
        });

        Self {
            tx,
            audit_repo,
            accounts,
            sessions,
            bans,
            clock,
            writer: Arc::new(Mutex::new(Some(writer))),
        }
    }

    /// Enqueue an entry for durable write without blocking the caller.
    pub fn log(
        &self,
        event: AuditEvent,
        player_id: Option<PlayerId>,
        username: Option<&str>,
        ip: &str,
        detail: impl Into<String>,
    ) {
        let entry = AuditEntry {
            event,
            player_id,
            username: username.map(str::to_string),
            ip: ip.to_string(),
            detail: detail.into(),
            created_at: self.clock.now(),
        };

        if let Err(e) = self.tx.try_send(WriterMessage::Record(Box::new(entry))) {
            log::warn!("audit queue rejected {} entry: {}", event, e);
        }
    }

    /// A player's audit history, most recent first.
    ///
    /// # Errors
    ///
    /// * `AuditError::Database` - the audit table could not be read
    pub async fn history(&self, player_id: PlayerId) -> AuditResult<Vec<AuditEntry>> {
        Ok(self.audit_repo.history_for(player_id).await?)
    }

    /// Aggregate statistics. `online_players` comes from the host (only it
    /// knows who is connected); everything else is counted from storage.
    ///
    /// # Errors
    ///
    /// * `AuditError::Database` - one of the aggregation queries failed
    pub async fn stats(&self, online_players: usize) -> AuditResult<AuthStats> {
        let now = self.clock.now();
        let midnight = now.date_naive().and_time(NaiveTime::MIN).and_utc();

        Ok(AuthStats {
            online_players,
            total_players: self.accounts.count().await?,
            active_sessions: self.sessions.count_active(now).await?,
            active_bans: self.bans.count_active(now).await?,
            failures_last_hour: self
                .audit_repo
                .count_events_since(AuditEvent::LoginFailure, now - Duration::hours(1))
                .await?,
            registrations_today: self
                .audit_repo
                .count_events_since(AuditEvent::Register, midnight)
                .await?,
        })
    }

    /// Stop accepting entries and wait for the writer to drain the queue.
    pub async fn shutdown(&self) {
        if self.tx.send(WriterMessage::Shutdown).await.is_err() {
            return;
        }
        if let Some(writer) = self.writer.lock().await.take()
            && let Err(e) = writer.await
        {
            log::warn!("audit writer did not shut down cleanly: {}", e);
        }
    }
}
