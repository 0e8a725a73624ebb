//! Authentication flow orchestration.
//!
//! Every inbound attempt runs the same gauntlet: anti-bot IP gate first,
//! then player-level cooldown and rate limiting, then credential or
//! second-factor verification, and only then a state transition plus session
//! issuance. Each security-relevant step is audited asynchronously without
//! blocking the flow.
//!
//! Operations for the same player are serialized through a per-player flow
//! lock; different players proceed concurrently. Validation failures are
//! returned as typed outcomes — `Err` always means infrastructure trouble.

use super::{
    errors::{AuthError, AuthResult},
    models::{
        AccountRecord, LoginOutcome, PasswordChangeOutcome, PlayerId, RegisterOutcome,
        TwoFactorOutcome,
    },
    password::CredentialHasher,
    state::{AuthPhase, PlayerStateMap},
};
use crate::{
    antibot::AntiBotService,
    audit::{AuditEvent, AuditLogService},
    clock::Clock,
    config::EngineConfig,
    db::AccountRepository,
    security::{CooldownCache, RateLimiter},
    session::{Session, SessionService},
    twofa::{TotpService, TwoFactorCheck, TwoFactorSetup},
};
use chrono::Duration;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock, atomic::{AtomicU32, Ordering}},
};

/// Authentication service composing the gate, credential, second-factor,
/// state, session, and audit components.
pub struct AuthService {
    accounts: Arc<dyn AccountRepository>,
    hasher: RwLock<Arc<CredentialHasher>>,
    state: Arc<PlayerStateMap>,
    sessions: Arc<SessionService>,
    totp: Arc<TotpService>,
    antibot: Arc<AntiBotService>,
    audit: AuditLogService,
    clock: Arc<dyn Clock>,
    login_cooldown: CooldownCache<PlayerId>,
    register_cooldown: CooldownCache<PlayerId>,
    login_limiter: RateLimiter<PlayerId>,
    max_two_factor_failures: AtomicU32,
    eviction_grace: RwLock<Duration>,
    /// Serializes flows per player; the map lock is never held across await
    flow_locks: Mutex<HashMap<PlayerId, Arc<tokio::sync::Mutex<()>>>>,
}

impl AuthService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        state: Arc<PlayerStateMap>,
        sessions: Arc<SessionService>,
        totp: Arc<TotpService>,
        antibot: Arc<AntiBotService>,
        audit: AuditLogService,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> AuthResult<Self> {
        let hasher = Arc::new(CredentialHasher::new(&config.hashing)?);
        Ok(Self {
            accounts,
            hasher: RwLock::new(hasher),
            state,
            sessions,
            totp,
            antibot,
            audit,
            clock: Arc::clone(&clock),
            login_cooldown: CooldownCache::new(
                Duration::seconds(config.cooldown.login_secs as i64),
                Arc::clone(&clock),
            ),
            register_cooldown: CooldownCache::new(
                Duration::seconds(config.cooldown.register_secs as i64),
                Arc::clone(&clock),
            ),
            login_limiter: RateLimiter::new(
                config.rate_limit.max_attempts,
                Duration::seconds(config.rate_limit.window_secs as i64),
                clock,
            ),
            max_two_factor_failures: AtomicU32::new(config.two_factor.max_consecutive_failures),
            eviction_grace: RwLock::new(Duration::seconds(config.eviction_grace_secs as i64)),
            flow_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Register a new account and authenticate the player.
    ///
    /// # Errors
    ///
    /// Infrastructure failures only; every validation failure is a
    /// [`RegisterOutcome`] variant.
    pub async fn register(
        &self,
        player_id: PlayerId,
        username: &str,
        ip: &str,
        password: &str,
    ) -> AuthResult<RegisterOutcome> {
        let flow = self.flow_lock(player_id);
        let _guard = flow.lock().await;

        let verdict = self.antibot.check_ip(ip).await?;
        if !verdict.is_allowed() {
            return Ok(RegisterOutcome::Banned(verdict));
        }

        if self.register_cooldown.is_on_cooldown(&player_id) {
            return Ok(RegisterOutcome::OnCooldown {
                remaining: self.register_cooldown.remaining(&player_id),
            });
        }
        self.register_cooldown.set(player_id);

        if self.accounts.find_by_player_id(player_id).await?.is_some() {
            return Ok(RegisterOutcome::AlreadyRegistered);
        }
        if let Err(reason) = validate_username(username) {
            return Ok(RegisterOutcome::InvalidUsername(reason));
        }
        if let Err(reason) = validate_password_strength(password) {
            return Ok(RegisterOutcome::WeakPassword(reason));
        }

        let password_hash = self.hash_blocking(password.to_string()).await?;
        let record = AccountRecord {
            player_id,
            username: username.to_string(),
            password_hash,
            created_at: self.clock.now(),
            last_login_at: None,
            last_login_ip: None,
        };
        self.accounts.insert(&record).await?;

        self.audit
            .log(AuditEvent::Register, Some(player_id), Some(username), ip, "account created");
        let session = self
            .finish_authentication(player_id, username, ip, "authenticated at registration")
            .await?;
        Ok(RegisterOutcome::Registered(session))
    }

    /// Submit credentials for an existing account.
    ///
    /// # Errors
    ///
    /// Infrastructure failures only; the anti-bot gate failing to answer is
    /// one of them (the caller fails closed).
    pub async fn login(
        &self,
        player_id: PlayerId,
        username: &str,
        ip: &str,
        password: &str,
    ) -> AuthResult<LoginOutcome> {
        let flow = self.flow_lock(player_id);
        let _guard = flow.lock().await;

        let verdict = self.antibot.check_ip(ip).await?;
        if !verdict.is_allowed() {
            return Ok(LoginOutcome::Banned(verdict));
        }

        let entry = self.state.entry(player_id);
        if entry.is_authenticated() {
            return Ok(LoginOutcome::AlreadyAuthenticated);
        }

        if self.login_cooldown.is_on_cooldown(&player_id) {
            return Ok(LoginOutcome::OnCooldown {
                remaining: self.login_cooldown.remaining(&player_id),
            });
        }
        self.login_cooldown.set(player_id);

        if !self.login_limiter.try_acquire(&player_id) {
            self.note_ip_failure(ip).await;
            return Ok(LoginOutcome::RateLimited);
        }

        let Some(account) = self.accounts.find_by_player_id(player_id).await? else {
            self.note_ip_failure(ip).await;
            self.audit.log(
                AuditEvent::LoginFailure,
                Some(player_id),
                Some(username),
                ip,
                "no account on record",
            );
            return Ok(LoginOutcome::NotRegistered);
        };

        let verified = self
            .verify_blocking(password.to_string(), account.password_hash.clone())
            .await?;
        if !verified {
            entry.record_failure();
            self.note_ip_failure(ip).await;
            self.audit.log(
                AuditEvent::LoginFailure,
                Some(player_id),
                Some(username),
                ip,
                "bad password",
            );
            return Ok(LoginOutcome::InvalidCredentials);
        }

        self.antibot.record_success(ip).await;

        if self.totp.is_enabled(player_id).await? {
            entry.reset_failures();
            entry.try_transition(AuthPhase::Unauthenticated, AuthPhase::AwaitingTwoFactor);
            return Ok(LoginOutcome::AwaitingTwoFactor);
        }

        let session = self
            .finish_authentication(player_id, username, ip, "authenticated")
            .await?;
        Ok(LoginOutcome::Authenticated(session))
    }

    /// Submit a second-factor code for a player in the awaiting-2FA phase.
    ///
    /// # Errors
    ///
    /// Infrastructure failures only.
    pub async fn submit_two_factor(
        &self,
        player_id: PlayerId,
        username: &str,
        ip: &str,
        code: &str,
    ) -> AuthResult<TwoFactorOutcome> {
        let flow = self.flow_lock(player_id);
        let _guard = flow.lock().await;

        let verdict = self.antibot.check_ip(ip).await?;
        if !verdict.is_allowed() {
            return Ok(TwoFactorOutcome::Banned(verdict));
        }

        let entry = self.state.entry(player_id);
        if entry.phase() != AuthPhase::AwaitingTwoFactor {
            return Ok(TwoFactorOutcome::NotAwaiting);
        }

        let check = self.totp.verify(player_id, code).await?;
        if check.is_accepted() {
            let detail = match check {
                TwoFactorCheck::AcceptedRecovery { remaining } => {
                    format!("recovery code used, {remaining} left")
                }
                _ => "second factor verified".to_string(),
            };
            let session = self
                .finish_authentication(player_id, username, ip, &detail)
                .await?;
            return Ok(TwoFactorOutcome::Authenticated(session));
        }

        // Invalid code: counted against both the player and the IP
        let failures = entry.record_failure();
        self.login_limiter.try_acquire(&player_id);
        self.note_ip_failure(ip).await;
        self.audit.log(
            AuditEvent::TwoFactorFailure,
            Some(player_id),
            Some(username),
            ip,
            format!("bad code ({failures} consecutive)"),
        );

        let max_failures = self.max_two_factor_failures.load(Ordering::SeqCst);
        if failures >= max_failures {
            entry.force_phase(AuthPhase::Unauthenticated);
            entry.reset_failures();
            return Ok(TwoFactorOutcome::Abandoned);
        }

        Ok(TwoFactorOutcome::Rejected {
            attempts_left: max_failures - failures,
        })
    }

    /// Reconnect path: authenticate from a live session for this binding,
    /// refreshing it when eligible. Returns `None` when the player must
    /// re-authenticate.
    ///
    /// A session whose account has vanished is a consistency violation; it
    /// is invalidated here and the caller re-authenticates.
    ///
    /// # Errors
    ///
    /// Infrastructure failures only.
    pub async fn resume_session(
        &self,
        player_id: PlayerId,
        username: &str,
        ip: &str,
    ) -> AuthResult<Option<Session>> {
        let flow = self.flow_lock(player_id);
        let _guard = flow.lock().await;

        let binding = Session::binding_for(player_id, ip);
        let Some(session) = self.sessions.validate(&binding).await? else {
            return Ok(None);
        };

        if self.accounts.find_by_player_id(player_id).await?.is_none() {
            log::warn!("session for deleted account {player_id}; invalidating");
            self.sessions.invalidate(player_id).await?;
            return Ok(None);
        }

        let session = self.sessions.refresh_if_eligible(&session).await?;
        let entry = self.state.entry(player_id);
        entry.force_phase(AuthPhase::Authenticated);
        entry.reset_failures();
        self.audit.log(
            AuditEvent::SessionResume,
            Some(player_id),
            Some(username),
            ip,
            "session resumed",
        );
        Ok(Some(session))
    }

    /// Drop the player's authenticated state and destroy their sessions.
    ///
    /// # Errors
    ///
    /// * `AuthError::Session` - session rows could not be removed
    pub async fn logout(&self, player_id: PlayerId) -> AuthResult<()> {
        if let Some(entry) = self.state.get(player_id) {
            entry.force_phase(AuthPhase::Unauthenticated);
        }
        self.sessions.invalidate(player_id).await?;
        Ok(())
    }

    /// Change the password of an authenticated player.
    ///
    /// # Errors
    ///
    /// Infrastructure failures only.
    pub async fn change_password(
        &self,
        player_id: PlayerId,
        username: &str,
        ip: &str,
        current_password: &str,
        new_password: &str,
    ) -> AuthResult<PasswordChangeOutcome> {
        let flow = self.flow_lock(player_id);
        let _guard = flow.lock().await;

        if !self.state.is_authenticated(player_id) {
            return Ok(PasswordChangeOutcome::NotAuthenticated);
        }
        let Some(account) = self.accounts.find_by_player_id(player_id).await? else {
            return Ok(PasswordChangeOutcome::NotRegistered);
        };

        let verified = self
            .verify_blocking(current_password.to_string(), account.password_hash.clone())
            .await?;
        if !verified {
            return Ok(PasswordChangeOutcome::WrongPassword);
        }
        if let Err(reason) = validate_password_strength(new_password) {
            return Ok(PasswordChangeOutcome::WeakPassword(reason));
        }

        let new_hash = self.hash_blocking(new_password.to_string()).await?;
        self.accounts.update_password_hash(player_id, &new_hash).await?;

        // All sessions die with the old password; the current binding gets a
        // fresh one so the player stays logged in
        self.sessions.invalidate(player_id).await?;
        self.sessions
            .issue(player_id, Session::binding_for(player_id, ip), Some(ip.to_string()))
            .await?;
        self.audit.log(
            AuditEvent::PasswordChange,
            Some(player_id),
            Some(username),
            ip,
            "password changed",
        );
        Ok(PasswordChangeOutcome::Changed)
    }

    /// Enroll an authenticated player in 2FA. Returns `None` if the player
    /// is not authenticated.
    ///
    /// # Errors
    ///
    /// Infrastructure failures only.
    pub async fn enroll_two_factor(
        &self,
        player_id: PlayerId,
        username: &str,
        ip: &str,
    ) -> AuthResult<Option<TwoFactorSetup>> {
        if !self.state.is_authenticated(player_id) {
            return Ok(None);
        }
        let setup = self.totp.enroll(player_id, username).await?;
        self.audit.log(
            AuditEvent::TwoFactorEnroll,
            Some(player_id),
            Some(username),
            ip,
            "enrollment pending confirmation",
        );
        Ok(Some(setup))
    }

    /// Confirm a pending 2FA enrollment with a first live code.
    ///
    /// # Errors
    ///
    /// Infrastructure failures only.
    pub async fn confirm_two_factor(&self, player_id: PlayerId, code: &str) -> AuthResult<bool> {
        Ok(self.totp.confirm_enrollment(player_id, code).await?)
    }

    /// Remove a player's second factor.
    ///
    /// # Errors
    ///
    /// Infrastructure failures only.
    pub async fn disable_two_factor(
        &self,
        player_id: PlayerId,
        username: &str,
        ip: &str,
    ) -> AuthResult<()> {
        self.totp.disable(player_id).await?;
        self.audit.log(
            AuditEvent::TwoFactorDisable,
            Some(player_id),
            Some(username),
            ip,
            "second factor removed",
        );
        Ok(())
    }

    /// Admin bypass of credential and second-factor checks. Always audited.
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
    ) -> AuthResult<Session> {
        let entry = self.state.entry(player_id);
        entry.force_phase(AuthPhase::Authenticated);
        entry.reset_failures();
        let session = self
            .sessions
            .issue(player_id, Session::binding_for(player_id, ip), Some(ip.to_string()))
            .await?;
        self.audit.log(
            AuditEvent::ForceLogin,
            Some(player_id),
            Some(username),
            ip,
            format!("by {admin}"),
        );
        Ok(session)
    }

    /// Admin password reset by account name. Destroys the player's sessions
    /// and forces re-authentication. Returns `false` when no account
    /// matches. Always audited.
    ///
    /// # Errors
    ///
    /// Infrastructure failures only.
    pub async fn admin_reset_password(
        &self,
        username: &str,
        new_password: &str,
        admin: &str,
    ) -> AuthResult<bool> {
        let Some(account) = self.accounts.find_by_username(username).await? else {
            return Ok(false);
        };

        let new_hash = self.hash_blocking(new_password.to_string()).await?;
        self.accounts
            .update_password_hash(account.player_id, &new_hash)
            .await?;
        self.sessions.invalidate(account.player_id).await?;
        if let Some(entry) = self.state.get(account.player_id) {
            entry.force_phase(AuthPhase::Unauthenticated);
        }
        self.audit.log(
            AuditEvent::PasswordReset,
            Some(account.player_id),
            Some(username),
            "admin",
            format!("by {admin}"),
        );
        Ok(true)
    }

    /// Cheap happy-path check; no locks beyond the state map read, no I/O.
    pub fn is_authenticated(&self, player_id: PlayerId) -> bool {
        self.state.is_authenticated(player_id)
    }

    /// Begin the eviction grace period for a disconnecting player. The
    /// durable account and any live session survive; only the in-memory
    /// entry is scheduled to go.
    pub fn handle_disconnect(&self, player_id: PlayerId) {
        let grace = *self.eviction_grace.read().expect("grace lock poisoned");
        self.state.mark_disconnected(player_id, grace);
    }

    /// Periodic sweep: evict lapsed state entries and prune expired
    /// cooldown/rate-limit/session-cache entries. Hosts call this on a
    /// timer; everything also self-prunes lazily on access.
    pub async fn maintenance(&self) {
        let evicted = self.state.evict_expired();
        let cooldowns = self.login_cooldown.prune() + self.register_cooldown.prune();
        let counters = self.login_limiter.prune();
        let sessions = self.sessions.prune_cache().await;
        log::debug!(
            "maintenance sweep: {evicted} state entries, {cooldowns} cooldowns, {counters} counters, {sessions} cached sessions"
        );
    }

    /// Re-derive configuration-dependent state without dropping sessions or
    /// in-flight logins.
    ///
    /// # Errors
    ///
    /// * `AuthError::HashingFailed` - the new work factor is rejected
    pub fn reconfigure(&self, config: &EngineConfig) -> AuthResult<()> {
        let hasher = Arc::new(CredentialHasher::new(&config.hashing)?);
        *self.hasher.write().expect("hasher lock poisoned") = hasher;
        self.login_cooldown
            .reconfigure(Duration::seconds(config.cooldown.login_secs as i64));
        self.register_cooldown
            .reconfigure(Duration::seconds(config.cooldown.register_secs as i64));
        self.login_limiter.reconfigure(
            config.rate_limit.max_attempts,
            Duration::seconds(config.rate_limit.window_secs as i64),
        );
        self.max_two_factor_failures
            .store(config.two_factor.max_consecutive_failures, Ordering::SeqCst);
        *self.eviction_grace.write().expect("grace lock poisoned") =
            Duration::seconds(config.eviction_grace_secs as i64);
        Ok(())
    }

    /// Authenticate, issue the session, and record the success.
    async fn finish_authentication(
        &self,
        player_id: PlayerId,
        username: &str,
        ip: &str,
        detail: &str,
    ) -> AuthResult<Session> {
        let entry = self.state.entry(player_id);
        entry.force_phase(AuthPhase::Authenticated);
        entry.reset_failures();
        self.login_limiter.reset(&player_id);

        let session = self
            .sessions
            .issue(player_id, Session::binding_for(player_id, ip), Some(ip.to_string()))
            .await?;
        self.accounts
            .update_last_login(player_id, self.clock.now(), ip)
            .await?;
        self.audit.log(
            AuditEvent::LoginSuccess,
            Some(player_id),
            Some(username),
            ip,
            detail.to_string(),
        );
        Ok(session)
    }

    /// Feed the anti-bot counters; audits a ban when this failure issued
    /// one. Recording trouble is logged, never propagated — the gate check
    /// at flow entry is the fail-closed point.
    async fn note_ip_failure(&self, ip: &str) {
        match self.antibot.record_failure(ip).await {
            Ok(Some(verdict)) => {
                self.audit.log(
                    AuditEvent::IpBan,
                    None,
                    None,
                    ip,
                    format!("automatic ban: {verdict:?}"),
                );
            }
            Ok(None) => {}
            Err(e) => log::warn!("failed to record anti-bot failure for {ip}: {e}"),
        }
    }

    fn flow_lock(&self, player_id: PlayerId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.flow_locks.lock().expect("flow lock map poisoned");
        Arc::clone(locks.entry(player_id).or_default())
    }

    fn current_hasher(&self) -> Arc<CredentialHasher> {
        Arc::clone(&self.hasher.read().expect("hasher lock poisoned"))
    }

    async fn hash_blocking(&self, password: String) -> AuthResult<String> {
        let hasher = self.current_hasher();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|_| AuthError::HashingFailed)?
    }

    async fn verify_blocking(&self, password: String, hash: String) -> AuthResult<bool> {
        let hasher = self.current_hasher();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|_| AuthError::HashingFailed)
    }
}

/// Username format rule: 3-16 characters, letters/digits/underscore.
fn validate_username(username: &str) -> Result<(), String> {
    let len = username.chars().count();
    if !(3..=16).contains(&len) {
        return Err("username must be 3-16 characters".to_string());
    }
    if !username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err("username may only contain letters, numbers, and underscores".to_string());
    }
    Ok(())
}

/// Password strength rule: at least 8 characters with a digit, an uppercase
/// and a lowercase letter.
fn validate_password_strength(password: &str) -> Result<(), String> {
    if password.len() < 8 {
        return Err("password must be at least 8 characters".to_string());
    }
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_uppercase = password.chars().any(|c| c.is_ascii_uppercase());
    let has_lowercase = password.chars().any(|c| c.is_ascii_lowercase());
    if !has_digit || !has_uppercase || !has_lowercase {
        return Err(
            "password must contain at least one number, one uppercase and one lowercase letter"
                .to_string(),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_rules() {
        assert!(validate_username("steve_7").is_ok());
        assert!(validate_username("ab").is_err());
        assert!(validate_username("this_name_is_way_too_long").is_err());
        assert!(validate_username("bad name").is_err());
    }

    #[test]
    fn password_rules() {
        assert!(validate_password_strength("Str0ngEnough").is_ok());
        assert!(validate_password_strength("short1A").is_err());
        assert!(validate_password_strength("alllowercase1").is_err());
        assert!(validate_password_strength("NoDigitsHere").is_err());
    }
}
