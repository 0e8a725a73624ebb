//! IP-level gate against automated abuse.
//!
//! Every authentication attempt is checked here before any credential work.
//! Each source IP accumulates windowed failure counts; crossing the
//! configured threshold issues a temporary ban whose duration escalates on
//! repeat violations and converts to permanent past the escalation cap. Ban
//! state is write-through persisted so bans survive a process restart; the
//! in-memory table is a cache over the ban repository, refreshed lazily on
//! lookup miss.

use crate::{
    clock::Clock,
    config::AntiBotConfig,
    db::{BanRepository, DbError},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, net::IpAddr, sync::Arc};
use thiserror::Error;
use tokio::sync::RwLock;

/// Anti-bot errors.
///
/// A failed lookup means the gate could not be evaluated; callers must fail
/// closed (treat the IP as not-yet-allowed), never fail open.
#[derive(Debug, Error)]
pub enum AntiBotError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] DbError),
}

/// Result type for anti-bot operations
pub type AntiBotResult<T> = Result<T, AntiBotError>;

/// Ban state of an IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BanState {
    /// Not banned
    None,
    /// Banned until the given instant; past it the state reads as `None`
    /// without an explicit unban
    Temp { expires_at: DateTime<Utc> },
    /// Banned until explicit admin unban
    Permanent,
}

impl BanState {
    fn verdict(&self, now: DateTime<Utc>) -> Verdict {
        match self {
            BanState::None => Verdict::Allow,
            BanState::Temp { expires_at } if *expires_at > now => Verdict::TempBanned {
                expires_at: *expires_at,
            },
            BanState::Temp { .. } => Verdict::Allow,
            BanState::Permanent => Verdict::PermaBanned,
        }
    }
}

/// The gate's decision for an IP at a given moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    TempBanned { expires_at: DateTime<Utc> },
    PermaBanned,
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Durable ban bookkeeping for one IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpBanRecord {
    pub ip: String,
    pub state: BanState,
    pub reason: String,
    /// Violations inside the escalation memory window
    pub violations: u32,
    pub created_at: DateTime<Utc>,
    pub last_violation_at: DateTime<Utc>,
}

/// In-memory risk bookkeeping per IP.
#[derive(Debug, Clone)]
struct IpRiskEntry {
    failures: u32,
    window_start: DateTime<Utc>,
    ban: BanState,
    reason: String,
    violations: u32,
    last_violation_at: Option<DateTime<Utc>>,
}

impl IpRiskEntry {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            failures: 0,
            window_start: now,
            ban: BanState::None,
            reason: String::new(),
            violations: 0,
            last_violation_at: None,
        }
    }

    fn from_record(record: &IpBanRecord, now: DateTime<Utc>) -> Self {
        Self {
            failures: 0,
            window_start: now,
            ban: record.state.clone(),
            reason: record.reason.clone(),
            violations: record.violations,
            last_violation_at: Some(record.last_violation_at),
        }
    }
}

/// Canonicalize an IP string so v4-mapped v6 addresses and textual variants
/// key the same entry.
pub fn normalize_ip(ip: &str) -> String {
    match ip.trim().parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(IpAddr::V4(v4)) => v4.to_string(),
        // Hostnames and malformed input key as-is
        Err(_) => ip.trim().to_string(),
    }
}

/// Per-IP risk scoring and ban management.
pub struct AntiBotService {
    repo: Arc<dyn BanRepository>,
    clock: Arc<dyn Clock>,
    config: std::sync::RwLock<AntiBotConfig>,
    entries: RwLock<HashMap<String, IpRiskEntry>>,
}

impl AntiBotService {
    pub fn new(
        repo: Arc<dyn BanRepository>,
        clock: Arc<dyn Clock>,
        config: AntiBotConfig,
    ) -> Self {
        Self {
            repo,
            clock,
            config: std::sync::RwLock::new(config),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Evaluate the gate for an IP.
    ///
    /// # Errors
    ///
    /// * `AntiBotError::Database` - the durable ban table could not be read;
    ///   the caller must fail closed
    pub async fn check_ip(&self, ip: &str) -> AntiBotResult<Verdict> {
        let key = normalize_ip(ip);
        let now = self.clock.now();

        if let Some(entry) = self.entries.read().await.get(&key) {
            return Ok(entry.ban.verdict(now));
        }

        let entry = self.load_entry(&key, now).await?;
        Ok(entry.ban.verdict(now))
    }

    /// Whether an IP is currently banned (temp bans past expiry count as not
    /// banned).
    pub async fn is_banned(&self, ip: &str) -> AntiBotResult<bool> {
        Ok(!self.check_ip(ip).await?.is_allowed())
    }

    /// Record a failed attempt from an IP.
    ///
    /// Returns the verdict issued by this failure if it crossed the
    /// threshold, so callers can audit new bans.
    pub async fn record_failure(&self, ip: &str) -> AntiBotResult<Option<Verdict>> {
        let key = normalize_ip(ip);
        let now = self.clock.now();
        let (threshold, window, memory) = {
            let config = self.config.read().expect("antibot config lock poisoned");
            (
                config.failure_threshold,
                Duration::seconds(config.window_secs as i64),
                Duration::seconds(config.violation_memory_secs as i64),
            )
        };

        self.load_entry(&key, now).await?;

        let record = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| IpRiskEntry::fresh(now));

            if !entry.ban.verdict(now).is_allowed() {
                return Ok(None);
            }

            // Violations outside the memory window no longer escalate
            if let Some(last) = entry.last_violation_at
                && now - last >= memory
            {
                entry.violations = 0;
            }

            if now - entry.window_start >= window {
                entry.failures = 0;
                entry.window_start = now;
            }

            entry.failures += 1;
            if entry.failures < threshold {
                return Ok(None);
            }

            entry.failures = 0;
            entry.window_start = now;
            entry.violations += 1;
            entry.last_violation_at = Some(now);
            entry.ban = self.escalated_ban(entry.violations, now);
            entry.reason = format!("failure threshold crossed ({} violations)", entry.violations);

            IpBanRecord {
                ip: key,
                state: entry.ban.clone(),
                reason: entry.reason.clone(),
                violations: entry.violations,
                created_at: now,
                last_violation_at: now,
            }
        };

        let verdict = record.state.verdict(now);
        self.repo.upsert(&record).await?;
        log::warn!(
            "banned {} ({}): {:?}",
            record.ip,
            record.reason,
            verdict
        );
        Ok(Some(verdict))
    }

    /// Record a successful attempt from an IP; decays the risk counter.
    pub async fn record_success(&self, ip: &str) {
        let key = normalize_ip(ip);
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&key) {
            entry.failures = 0;
        }
    }

    /// Explicit admin ban. `duration` of `None` means permanent.
    ///
    /// # Errors
    ///
    /// * `AntiBotError::Database` - the ban could not be persisted
    pub async fn ban_ip(
        &self,
        ip: &str,
        duration: Option<Duration>,
        reason: &str,
    ) -> AntiBotResult<IpBanRecord> {
        let key = normalize_ip(ip);
        let now = self.clock.now();
        let state = match duration {
            Some(duration) => BanState::Temp {
                expires_at: now + duration,
            },
            None => BanState::Permanent,
        };

        let record = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| IpRiskEntry::fresh(now));
            entry.ban = state.clone();
            entry.reason = reason.to_string();
            entry.last_violation_at = Some(now);

            IpBanRecord {
                ip: key,
                state,
                reason: reason.to_string(),
                violations: entry.violations,
                created_at: now,
                last_violation_at: now,
            }
        };

        self.repo.upsert(&record).await?;
        Ok(record)
    }

    /// Clear any ban for an IP, including permanent ones. Returns whether a
    /// ban was actually in effect.
    ///
    /// # Errors
    ///
    /// * `AntiBotError::Database` - the durable entry could not be removed
    pub async fn unban_ip(&self, ip: &str) -> AntiBotResult<bool> {
        let key = normalize_ip(ip);
        let now = self.clock.now();

        let cached = {
            let mut entries = self.entries.write().await;
            entries.get_mut(&key).map(|entry| {
                let banned = !entry.ban.verdict(now).is_allowed();
                entry.ban = BanState::None;
                entry.violations = 0;
                entry.failures = 0;
                banned
            })
        };
        let was_banned = match cached {
            Some(banned) => banned,
            None => match self.repo.find(&key).await? {
                Some(record) => !record.state.verdict(now).is_allowed(),
                None => false,
            },
        };

        self.repo.delete(&key).await?;
        Ok(was_banned)
    }

    /// All non-expired temp bans plus permanent bans, from the durable
    /// source of truth.
    pub async fn list_active_bans(&self) -> AntiBotResult<Vec<IpBanRecord>> {
        Ok(self.repo.list_active(self.clock.now()).await?)
    }

    /// Apply new thresholds to subsequent checks without dropping state.
    pub fn reconfigure(&self, config: AntiBotConfig) {
        *self.config.write().expect("antibot config lock poisoned") = config;
    }

    /// Ban duration for the nth violation: `base * factor^(n-1)`, converting
    /// to permanent past the escalation cap.
    fn escalated_ban(&self, violations: u32, now: DateTime<Utc>) -> BanState {
        let config = self.config.read().expect("antibot config lock poisoned");
        if violations > config.max_escalations {
            return BanState::Permanent;
        }
        let exponent = violations.saturating_sub(1).min(16);
        let multiplier = u64::from(config.escalation_factor).saturating_pow(exponent);
        let secs = config.base_ban_secs.saturating_mul(multiplier);
        BanState::Temp {
            expires_at: now + Duration::seconds(secs.min(i64::MAX as u64) as i64),
        }
    }

    /// Pull the durable record for a key into the cache on miss.
    async fn load_entry(&self, key: &str, now: DateTime<Utc>) -> AntiBotResult<IpRiskEntry> {
        if let Some(entry) = self.entries.read().await.get(key) {
            return Ok(entry.clone());
        }

        let loaded = match self.repo.find(key).await? {
            Some(record) => IpRiskEntry::from_record(&record, now),
            None => IpRiskEntry::fresh(now),
        };

        let mut entries = self.entries.write().await;
        // Another task may have loaded the key while we read the repository
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| loaded.clone());
        Ok(entry.clone())
    }
}
