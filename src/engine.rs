//! Engine wiring and the admin-facing surface.
//!
//! [`AuthEngine`] builds every service with constructor injection in explicit
//! dependency order, owns the admin operations the host's command layer maps
//! onto, and supports configuration reload without dropping sessions.

use crate::{
    antibot::{AntiBotService, IpBanRecord, Verdict},
    audit::{AuditEntry, AuditLogService, AuthStats},
    auth::{AuthService, PlayerId, PlayerStateMap},
    clock::{Clock, SystemClock},
    config::{ConfigError, EngineConfig},
    db::{Database, DatabaseConfig, Repositories},
    diag::DebugLogger,
    integration::{PermissionBridge, select_bridge},
    session::{Session, SessionService},
    twofa::TotpService,
};
use crate::audit::AuditEvent;
use chrono::Duration;
use std::{
    sync::{Arc, RwLock},
    time::Instant,
};
use thiserror::Error;

/// Engine construction and lifecycle errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration failed validation
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A service failed to initialize or an operation failed
    #[error(transparent)]
    Auth(#[from] crate::auth::AuthError),

    /// Database connection failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Anti-bot operation failed
    #[error(transparent)]
    AntiBot(#[from] crate::antibot::AntiBotError),

    /// Audit query failed
    #[error(transparent)]
    Audit(#[from] crate::audit::AuditError),
}

/// Result of reloading one service's configuration
#[derive(Debug, Clone)]
pub struct ReloadStatus {
    pub module: &'static str,
    pub duration: std::time::Duration,
}

/// Measures startup stage durations and logs a summary table.
struct StartupTimer {
    stages: Vec<(&'static str, std::time::Duration)>,
    overall: Instant,
    current: Instant,
}

impl StartupTimer {
    const SLOW_THRESHOLD_MS: u128 = 200;

    fn new() -> Self {
        let now = Instant::now();
        Self {
            stages: Vec::new(),
            overall: now,
            current: now,
        }
    }

    fn stage(&mut self, name: &'static str) {
        self.stages.push((name, self.current.elapsed()));
        self.current = Instant::now();
    }

    fn print_summary(&self) {
        log::info!("[startup] ─────────────────────────────");
        for (name, elapsed) in &self.stages {
            let marker = if elapsed.as_millis() > Self::SLOW_THRESHOLD_MS {
                " <- SLOW"
            } else {
                ""
            };
            log::info!("[startup] {name:<24} {}ms{marker}", elapsed.as_millis());
        }
        log::info!("[startup] {:<24} {}ms", "TOTAL", self.overall.elapsed().as_millis());
    }
}

/// The assembled authentication engine.
///
/// Everything the host integrates against hangs off this type: the
/// authentication flows via [`AuthEngine::auth`], the admin surface as
/// methods here, and the component services for hosts that need them
/// directly.
pub struct AuthEngine {
    config: RwLock<EngineConfig>,
    state: Arc<PlayerStateMap>,
    sessions: Arc<SessionService>,
    totp: Arc<TotpService>,
    antibot: Arc<AntiBotService>,
    audit: AuditLogService,
    auth: Arc<AuthService>,
    debug: DebugLogger,
    bridge: Arc<dyn PermissionBridge>,
}

impl AuthEngine {
    /// Wire the engine over the given repositories. Must be called from
    /// within a tokio runtime (the audit writer task spawns here).
    ///
    /// # Errors
    ///
    /// * `EngineError::Config` - the configuration failed validation
    /// * `EngineError::Auth` - a service rejected its configuration
    pub fn new(
        config: EngineConfig,
        repos: Repositories,
        clock: Arc<dyn Clock>,
        detected_bridge: Option<Arc<dyn PermissionBridge>>,
    ) -> Result<Self, EngineError> {
        let mut timer = StartupTimer::new();

        config.validate()?;
        let debug = DebugLogger::new(config.debug);
        timer.stage("config");

        let state = Arc::new(PlayerStateMap::new(Arc::clone(&clock)));
        let sessions = Arc::new(SessionService::new(
            Arc::clone(&repos.sessions),
            Arc::clone(&clock),
            config.session.clone(),
        ));
        let totp = Arc::new(TotpService::new(
            Arc::clone(&repos.two_factor),
            Arc::clone(&clock),
            config.two_factor.clone(),
        ));
        let antibot = Arc::new(AntiBotService::new(
            Arc::clone(&repos.bans),
            Arc::clone(&clock),
            config.antibot.clone(),
        ));
        let audit = AuditLogService::new(
            Arc::clone(&repos.audit),
            Arc::clone(&repos.accounts),
            Arc::clone(&repos.sessions),
            Arc::clone(&repos.bans),
            Arc::clone(&clock),
            config.audit_queue_capacity,
        );
        timer.stage("services");

        let auth = Arc::new(AuthService::new(
            Arc::clone(&repos.accounts),
            Arc::clone(&state),
            Arc::clone(&sessions),
            Arc::clone(&totp),
            Arc::clone(&antibot),
            audit.clone(),
            Arc::clone(&clock),
            &config,
        )?);
        timer.stage("auth");

        let bridge = select_bridge(detected_bridge);
        timer.stage("integrations");

        timer.print_summary();
        log::info!("authentication engine ready");

        Ok(Self {
            config: RwLock::new(config),
            state,
            sessions,
            totp,
            antibot,
            audit,
            auth,
            debug,
            bridge,
        })
    }

    /// Wire the engine over the in-memory backend: no database, nothing
    /// survives a restart.
    ///
    /// # Errors
    ///
    /// Same as [`AuthEngine::new`].
    pub fn with_memory_backend(config: EngineConfig) -> Result<Self, EngineError> {
        Self::new(config, Repositories::in_memory(), Arc::new(SystemClock), None)
    }

    /// Connect to PostgreSQL and wire the engine over it.
    ///
    /// # Errors
    ///
    /// * `EngineError::Database` - the pool could not be established
    /// * plus everything [`AuthEngine::new`] returns
    pub async fn connect(
        config: EngineConfig,
        db_config: &DatabaseConfig,
    ) -> Result<Self, EngineError> {
        let database = Database::new(db_config).await?;
        database.health_check().await?;
        Self::new(
            config,
            Repositories::postgres(database.pool().clone()),
            Arc::new(SystemClock),
            None,
        )
    }

    // ── Component access ────────────────────────────────────────────────

    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    pub fn sessions(&self) -> &SessionService {
        &self.sessions
    }

    pub fn totp(&self) -> &TotpService {
        &self.totp
    }

    pub fn antibot(&self) -> &AntiBotService {
        &self.antibot
    }

    pub fn audit(&self) -> &AuditLogService {
        &self.audit
    }

    pub fn state(&self) -> &PlayerStateMap {
        &self.state
    }

    pub fn permission_bridge(&self) -> &Arc<dyn PermissionBridge> {
        &self.bridge
    }

    pub fn config(&self) -> EngineConfig {
        self.config.read().expect("config lock poisoned").clone()
    }

    // ── Admin surface ───────────────────────────────────────────────────

    /// Re-derive every configuration-dependent threshold without dropping
    /// sessions or in-flight logins. Returns per-service timings.
    ///
    /// # Errors
    ///
    /// * `EngineError::Config` - the new configuration failed validation
    /// * `EngineError::Auth` - the new hashing work factor was rejected
    pub fn reload(&self, config: EngineConfig) -> Result<Vec<ReloadStatus>, EngineError> {
        config.validate()?;
        let mut statuses = Vec::new();

        let start = Instant::now();
        self.auth.reconfigure(&config)?;
        statuses.push(ReloadStatus {
            module: "auth",
            duration: start.elapsed(),
        });

        let start = Instant::now();
        self.sessions.reconfigure(config.session.clone());
        statuses.push(ReloadStatus {
            module: "sessions",
            duration: start.elapsed(),
        });

        let start = Instant::now();
        self.totp.reconfigure(config.two_factor.clone());
        statuses.push(ReloadStatus {
            module: "twofa",
            duration: start.elapsed(),
        });

        let start = Instant::now();
        self.antibot.reconfigure(config.antibot.clone());
        statuses.push(ReloadStatus {
            module: "antibot",
            duration: start.elapsed(),
        });

        self.debug.set(config.debug);
        *self.config.write().expect("config lock poisoned") = config;

        for status in &statuses {
            log::info!("reloaded {} in {}ms", status.module, status.duration.as_millis());
        }
        Ok(statuses)
    }

    /// Bypass credential and second-factor checks for a player. Audited.
    ///
    /// # Errors
    ///
    /// Infrastructure failures only.
    pub async fn force_authenticate(
        &self,
        player_id: PlayerId,
        username: &str,
        ip: &str,
        admin: &str,
    ) -> Result<Session, EngineError> {
        Ok(self.auth.force_authenticate(player_id, username, ip, admin).await?)
    }

    /// Reset an account's password by name. Audited. Returns `false` when
    /// no account matches.
    ///
    /// # Errors
    ///
    /// Infrastructure failures only.
    pub async fn reset_password(
        &self,
        username: &str,
        new_password: &str,
        admin: &str,
    ) -> Result<bool, EngineError> {
        Ok(self.auth.admin_reset_password(username, new_password, admin).await?)
    }

    /// Ban an IP, temporarily or permanently. Audited.
    ///
    /// # Errors
    ///
    /// * `EngineError::AntiBot` - the ban could not be persisted
    pub async fn ban_ip(
        &self,
        ip: &str,
        duration: Option<Duration>,
        reason: &str,
        admin: &str,
    ) -> Result<IpBanRecord, EngineError> {
        let record = self.antibot.ban_ip(ip, duration, reason).await?;
        self.audit.log(
            AuditEvent::IpBan,
            None,
            None,
            &record.ip,
            format!("by {admin}: {reason}"),
        );
        Ok(record)
    }

    /// Lift any ban on an IP, including permanent ones. Audited when a ban
    /// was actually in effect.
    ///
    /// # Errors
    ///
    /// * `EngineError::AntiBot` - the durable entry could not be removed
    pub async fn unban_ip(&self, ip: &str, admin: &str) -> Result<bool, EngineError> {
        let was_banned = self.antibot.unban_ip(ip).await?;
        if was_banned {
            self.audit
                .log(AuditEvent::IpUnban, None, None, ip, format!("by {admin}"));
        }
        Ok(was_banned)
    }

    /// Current gate verdict for an IP.
    ///
    /// # Errors
    ///
    /// * `EngineError::AntiBot` - the gate could not be evaluated
    pub async fn check_ip(&self, ip: &str) -> Result<Verdict, EngineError> {
        Ok(self.antibot.check_ip(ip).await?)
    }

    /// Non-expired temp bans plus permanent bans.
    ///
    /// # Errors
    ///
    /// * `EngineError::AntiBot` - the ban table could not be read
    pub async fn list_active_bans(&self) -> Result<Vec<IpBanRecord>, EngineError> {
        Ok(self.antibot.list_active_bans().await?)
    }

    /// A player's audit history, most recent first.
    ///
    /// # Errors
    ///
    /// * `EngineError::Audit` - the audit table could not be read
    pub async fn history(&self, player_id: PlayerId) -> Result<Vec<AuditEntry>, EngineError> {
        Ok(self.audit.history(player_id).await?)
    }

    /// Aggregate security statistics.
    ///
    /// # Errors
    ///
    /// * `EngineError::Audit` - an aggregation query failed
    pub async fn stats(&self, online_players: usize) -> Result<AuthStats, EngineError> {
        Ok(self.audit.stats(online_players).await?)
    }

    /// Toggle verbose diagnostics; returns the new state.
    pub fn toggle_debug(&self) -> bool {
        let enabled = self.debug.toggle();
        log::info!("verbose diagnostics {}", if enabled { "enabled" } else { "disabled" });
        enabled
    }

    pub fn debug(&self) -> &DebugLogger {
        &self.debug
    }

    /// Flush the audit queue and stop the writer. Sessions and bans are
    /// durable; nothing else needs a goodbye.
    pub async fn shutdown(&self) {
        log::info!("authentication engine shutting down");
        self.audit.shutdown().await;
    }
}
