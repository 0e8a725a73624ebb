//! Repository trait definitions and their PostgreSQL implementations.
//!
//! The traits are the persistence contract the engine is written against;
//! backends are injected, so tests and embedded hosts can swap in
//! [`super::memory::MemoryBackend`] without touching the services.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::sync::Arc;

use super::{DbError, DbResult};
use crate::antibot::{BanState, IpBanRecord};
use crate::audit::{AuditEntry, AuditEvent};
use crate::auth::models::{AccountRecord, PlayerId};
use crate::session::Session;
use crate::twofa::TwoFactorRecord;

/// Durable account rows
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn find_by_player_id(&self, player_id: PlayerId) -> DbResult<Option<AccountRecord>>;

    async fn find_by_username(&self, username: &str) -> DbResult<Option<AccountRecord>>;

    async fn insert(&self, record: &AccountRecord) -> DbResult<()>;

    async fn update_password_hash(&self, player_id: PlayerId, password_hash: &str) -> DbResult<()>;

    async fn update_last_login(
        &self,
        player_id: PlayerId,
        at: DateTime<Utc>,
        ip: &str,
    ) -> DbResult<()>;

    async fn count(&self) -> DbResult<u64>;

    /// Explicit admin removal; the engine itself never deletes accounts
    async fn delete(&self, player_id: PlayerId) -> DbResult<()>;
}

/// Durable session rows, keyed by binding
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Resolve a binding to its session, enforcing expiry repository-side
    async fn find_active(&self, binding: &str, now: DateTime<Utc>) -> DbResult<Option<Session>>;

    /// Insert or replace the session for a binding
    async fn upsert(&self, session: &Session) -> DbResult<()>;

    async fn delete_for_binding(&self, binding: &str) -> DbResult<()>;

    async fn delete_for_player(&self, player_id: PlayerId) -> DbResult<()>;

    async fn count_active(&self, now: DateTime<Utc>) -> DbResult<u64>;
}

/// Durable second-factor state
#[async_trait]
pub trait TwoFactorRepository: Send + Sync {
    async fn find(&self, player_id: PlayerId) -> DbResult<Option<TwoFactorRecord>>;

    async fn upsert(&self, record: &TwoFactorRecord) -> DbResult<()>;

    async fn delete(&self, player_id: PlayerId) -> DbResult<()>;
}

/// Durable IP ban table
#[async_trait]
pub trait BanRepository: Send + Sync {
    async fn find(&self, ip: &str) -> DbResult<Option<IpBanRecord>>;

    async fn upsert(&self, record: &IpBanRecord) -> DbResult<()>;

    async fn delete(&self, ip: &str) -> DbResult<()>;

    /// Non-expired temp bans plus permanent bans
    async fn list_active(&self, now: DateTime<Utc>) -> DbResult<Vec<IpBanRecord>>;

    async fn count_active(&self, now: DateTime<Utc>) -> DbResult<u64>;
}

/// Append-only audit trail
#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> DbResult<()>;

    /// Entries for a player, most recent first
    async fn history_for(&self, player_id: PlayerId) -> DbResult<Vec<AuditEntry>>;

    async fn count_events_since(&self, event: AuditEvent, since: DateTime<Utc>) -> DbResult<u64>;
}

/// Bundle of every repository the engine needs, behind one injection point.
#[derive(Clone)]
pub struct Repositories {
    pub accounts: Arc<dyn AccountRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub two_factor: Arc<dyn TwoFactorRepository>,
    pub bans: Arc<dyn BanRepository>,
    pub audit: Arc<dyn AuditRepository>,
}

impl Repositories {
    /// PostgreSQL-backed repositories sharing one pool.
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            accounts: Arc::new(PgAccountRepository::new(pool.clone())),
            sessions: Arc::new(PgSessionRepository::new(pool.clone())),
            two_factor: Arc::new(PgTwoFactorRepository::new(pool.clone())),
            bans: Arc::new(PgBanRepository::new(pool.clone())),
            audit: Arc::new(PgAuditRepository::new(pool)),
        }
    }

    /// Fully in-memory repositories sharing one backend. Suitable for tests
    /// and hosts that do not want a database.
    pub fn in_memory() -> Self {
        super::memory::MemoryBackend::new().into_repositories()
    }
}

/// PostgreSQL implementation of [`AccountRepository`]
pub struct PgAccountRepository {
    pool: PgPool,
}

impl PgAccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn account_from_row(row: &sqlx::postgres::PgRow) -> AccountRecord {
    AccountRecord {
        player_id: row.get("player_id"),
        username: row.get("username"),
        password_hash: row.get("password_hash"),
        created_at: row.get::<chrono::NaiveDateTime, _>("created_at").and_utc(),
        last_login_at: row
            .get::<Option<chrono::NaiveDateTime>, _>("last_login_at")
            .map(|dt| dt.and_utc()),
        last_login_ip: row.get("last_login_ip"),
    }
}

#[async_trait]
impl AccountRepository for PgAccountRepository {
    async fn find_by_player_id(&self, player_id: PlayerId) -> DbResult<Option<AccountRecord>> {
        let row = sqlx::query(
            "SELECT player_id, username, password_hash, created_at, last_login_at, last_login_ip
             FROM accounts WHERE player_id = $1",
        )
        .bind(player_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(account_from_row))
    }

    async fn find_by_username(&self, username: &str) -> DbResult<Option<AccountRecord>> {
        let row = sqlx::query(
            "SELECT player_id, username, password_hash, created_at, last_login_at, last_login_ip
             FROM accounts WHERE lower(username) = lower($1)",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(account_from_row))
    }

    async fn insert(&self, record: &AccountRecord) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO accounts (player_id, username, password_hash, created_at, last_login_at, last_login_ip)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.player_id)
        .bind(&record.username)
        .bind(&record.password_hash)
        .bind(record.created_at.naive_utc())
        .bind(record.last_login_at.map(|dt| dt.naive_utc()))
        .bind(&record.last_login_ip)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_password_hash(&self, player_id: PlayerId, password_hash: &str) -> DbResult<()> {
        sqlx::query("UPDATE accounts SET password_hash = $2 WHERE player_id = $1")
            .bind(player_id)
            .bind(password_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_last_login(
        &self,
        player_id: PlayerId,
        at: DateTime<Utc>,
        ip: &str,
    ) -> DbResult<()> {
        sqlx::query("UPDATE accounts SET last_login_at = $2, last_login_ip = $3 WHERE player_id = $1")
            .bind(player_id)
            .bind(at.naive_utc())
            .bind(ip)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count(&self) -> DbResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM accounts")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n").max(0) as u64)
    }

    async fn delete(&self, player_id: PlayerId) -> DbResult<()> {
        sqlx::query("DELETE FROM accounts WHERE player_id = $1")
            .bind(player_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// PostgreSQL implementation of [`SessionRepository`]
pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn find_active(&self, binding: &str, now: DateTime<Utc>) -> DbResult<Option<Session>> {
        let row = sqlx::query(
            "SELECT binding, player_id, token, issued_at, expires_at, ip
             FROM sessions WHERE binding = $1 AND expires_at > $2",
        )
        .bind(binding)
        .bind(now.naive_utc())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Session {
            player_id: r.get("player_id"),
            token: r.get("token"),
            binding: r.get("binding"),
            issued_at: r.get::<chrono::NaiveDateTime, _>("issued_at").and_utc(),
            expires_at: r.get::<chrono::NaiveDateTime, _>("expires_at").and_utc(),
            ip: r.get("ip"),
        }))
    }

    async fn upsert(&self, session: &Session) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO sessions (binding, player_id, token, issued_at, expires_at, ip)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (binding)
             DO UPDATE SET
                 player_id = EXCLUDED.player_id,
                 token = EXCLUDED.token,
                 issued_at = EXCLUDED.issued_at,
                 expires_at = EXCLUDED.expires_at,
                 ip = EXCLUDED.ip",
        )
        .bind(&session.binding)
        .bind(session.player_id)
        .bind(session.token)
        .bind(session.issued_at.naive_utc())
        .bind(session.expires_at.naive_utc())
        .bind(&session.ip)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_for_binding(&self, binding: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM sessions WHERE binding = $1")
            .bind(binding)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_for_player(&self, player_id: PlayerId) -> DbResult<()> {
        sqlx::query("DELETE FROM sessions WHERE player_id = $1")
            .bind(player_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_active(&self, now: DateTime<Utc>) -> DbResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sessions WHERE expires_at > $1")
            .bind(now.naive_utc())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n").max(0) as u64)
    }
}

/// PostgreSQL implementation of [`TwoFactorRepository`]
pub struct PgTwoFactorRepository {
    pool: PgPool,
}

impl PgTwoFactorRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TwoFactorRepository for PgTwoFactorRepository {
    async fn find(&self, player_id: PlayerId) -> DbResult<Option<TwoFactorRecord>> {
        let row = sqlx::query(
            "SELECT player_id, secret, confirmed, recovery_codes, enrolled_at
             FROM two_factor_auth WHERE player_id = $1",
        )
        .bind(player_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| TwoFactorRecord {
            player_id: r.get("player_id"),
            secret: r.get("secret"),
            confirmed: r.get("confirmed"),
            recovery_codes: r.get("recovery_codes"),
            enrolled_at: r.get::<chrono::NaiveDateTime, _>("enrolled_at").and_utc(),
        }))
    }

    async fn upsert(&self, record: &TwoFactorRecord) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO two_factor_auth (player_id, secret, confirmed, recovery_codes, enrolled_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (player_id)
             DO UPDATE SET
                 secret = EXCLUDED.secret,
                 confirmed = EXCLUDED.confirmed,
                 recovery_codes = EXCLUDED.recovery_codes,
                 enrolled_at = EXCLUDED.enrolled_at",
        )
        .bind(record.player_id)
        .bind(&record.secret)
        .bind(record.confirmed)
        .bind(&record.recovery_codes)
        .bind(record.enrolled_at.naive_utc())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, player_id: PlayerId) -> DbResult<()> {
        sqlx::query("DELETE FROM two_factor_auth WHERE player_id = $1")
            .bind(player_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// PostgreSQL implementation of [`BanRepository`]
pub struct PgBanRepository {
    pool: PgPool,
}

impl PgBanRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn ban_from_row(row: &sqlx::postgres::PgRow) -> DbResult<IpBanRecord> {
    let ip: String = row.get("ip");
    let permanent: bool = row.get("permanent");
    let expires_at = row
        .get::<Option<chrono::NaiveDateTime>, _>("expires_at")
        .map(|dt| dt.and_utc());
    let state = match (permanent, expires_at) {
        (true, _) => BanState::Permanent,
        (false, Some(expires_at)) => BanState::Temp { expires_at },
        (false, None) => {
            return Err(DbError::Corruption(format!(
                "ban row for {ip} is neither permanent nor expiring"
            )));
        }
    };

    let violations: i32 = row.get("violations");
    if violations < 0 {
        return Err(DbError::Corruption(format!(
            "negative violation count {violations} for {ip}"
        )));
    }

    Ok(IpBanRecord {
        ip,
        state,
        reason: row.get("reason"),
        violations: violations as u32,
        created_at: row.get::<chrono::NaiveDateTime, _>("created_at").and_utc(),
        last_violation_at: row
            .get::<chrono::NaiveDateTime, _>("last_violation_at")
            .and_utc(),
    })
}

#[async_trait]
impl BanRepository for PgBanRepository {
    async fn find(&self, ip: &str) -> DbResult<Option<IpBanRecord>> {
        let row = sqlx::query(
            "SELECT ip, permanent, expires_at, reason, violations, created_at, last_violation_at
             FROM ip_bans WHERE ip = $1",
        )
        .bind(ip)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(ban_from_row).transpose()
    }

    async fn upsert(&self, record: &IpBanRecord) -> DbResult<()> {
        let (permanent, expires_at) = match &record.state {
            BanState::Permanent => (true, None),
            BanState::Temp { expires_at } => (false, Some(expires_at.naive_utc())),
            // An unbanned entry has no row; delete instead
            BanState::None => return self.delete(&record.ip).await,
        };

        sqlx::query(
            "INSERT INTO ip_bans (ip, permanent, expires_at, reason, violations, created_at, last_violation_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (ip)
             DO UPDATE SET
                 permanent = EXCLUDED.permanent,
                 expires_at = EXCLUDED.expires_at,
                 reason = EXCLUDED.reason,
                 violations = EXCLUDED.violations,
                 last_violation_at = EXCLUDED.last_violation_at",
        )
        .bind(&record.ip)
        .bind(permanent)
        .bind(expires_at)
        .bind(&record.reason)
        .bind(record.violations as i32)
        .bind(record.created_at.naive_utc())
        .bind(record.last_violation_at.naive_utc())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, ip: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM ip_bans WHERE ip = $1")
            .bind(ip)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_active(&self, now: DateTime<Utc>) -> DbResult<Vec<IpBanRecord>> {
        let rows = sqlx::query(
            "SELECT ip, permanent, expires_at, reason, violations, created_at, last_violation_at
             FROM ip_bans
             WHERE permanent OR expires_at > $1
             ORDER BY created_at DESC",
        )
        .bind(now.naive_utc())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(ban_from_row).collect()
    }

    async fn count_active(&self, now: DateTime<Utc>) -> DbResult<u64> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM ip_bans WHERE permanent OR expires_at > $1")
                .bind(now.naive_utc())
                .fetch_one(&self.pool)
                .await?;
        Ok(row.get::<i64, _>("n").max(0) as u64)
    }
}

/// PostgreSQL implementation of [`AuditRepository`]
pub struct PgAuditRepository {
    pool: PgPool,
}

impl PgAuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditRepository for PgAuditRepository {
    async fn append(&self, entry: &AuditEntry) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO audit_log (event, player_id, username, ip, detail, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(entry.event.as_str())
        .bind(entry.player_id)
        .bind(&entry.username)
        .bind(&entry.ip)
        .bind(&entry.detail)
        .bind(entry.created_at.naive_utc())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn history_for(&self, player_id: PlayerId) -> DbResult<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT event, player_id, username, ip, detail, created_at
             FROM audit_log WHERE player_id = $1
             ORDER BY created_at DESC",
        )
        .bind(player_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let raw: String = r.get("event");
                let event = AuditEvent::parse(&raw)
                    .ok_or_else(|| DbError::Corruption(format!("unknown audit event '{raw}'")))?;
                Ok(AuditEntry {
                    event,
                    player_id: r.get("player_id"),
                    username: r.get("username"),
                    ip: r.get("ip"),
                    detail: r.get("detail"),
                    created_at: r.get::<chrono::NaiveDateTime, _>("created_at").and_utc(),
                })
            })
            .collect()
    }

    async fn count_events_since(&self, event: AuditEvent, since: DateTime<Utc>) -> DbResult<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM audit_log WHERE event = $1 AND created_at >= $2",
        )
        .bind(event.as_str())
        .bind(since.naive_utc())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n").max(0) as u64)
    }
}
