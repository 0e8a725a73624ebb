//! # Secure Auth
//!
//! A player-authentication and account-security engine for multiplayer game
//! servers. The host server owns connections and commands; this crate gates
//! every connecting player behind credential verification, per-player session
//! validity, a TOTP second factor, and an anti-bot scoring/ban gate, with an
//! asynchronous audit trail underneath.
//!
//! ## Architecture
//!
//! Every inbound attempt (login, register, 2FA submit) runs the same
//! gauntlet, leaf components first:
//!
//! - **Anti-bot gate**: per-IP risk scoring with escalating temp bans that
//!   convert to permanent, persisted so bans survive restart
//! - **Cooldown / rate limiter**: per-player attempt throttles with
//!   auto-expiring entries
//! - **Credential hasher**: salted Argon2id with a configurable work factor
//! - **Second factor**: TOTP with ±1 step skew, single-use recovery codes,
//!   and per-step replay rejection
//! - **State machine**: unauthenticated → awaiting-2FA → authenticated,
//!   mutated only through compare-and-swap transitions
//! - **Sessions**: binding-keyed, repository-backed, renewable only within a
//!   configured window
//! - **Audit log**: bounded queue drained by a dedicated writer task;
//!   best-effort with respect to the audited action
//!
//! Persistence is trait-injected: PostgreSQL for production, an in-memory
//! backend for tests and hosts without a database.
//!
//! ## Example
//!
//! ```
//! use secure_auth::{AuthEngine, EngineConfig, LoginOutcome};
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = AuthEngine::with_memory_backend(EngineConfig::default())?;
//!
//!     let player = Uuid::new_v4();
//!     engine.auth().register(player, "steve", "203.0.113.7", "Str0ngPass").await?;
//!
//!     match engine.auth().login(player, "steve", "203.0.113.7", "Str0ngPass").await? {
//!         LoginOutcome::AlreadyAuthenticated | LoginOutcome::Authenticated(_) => {}
//!         other => println!("rejected: {other:?}"),
//!     }
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Per-IP risk scoring and ban management.
pub mod antibot;
/// Asynchronous audit trail and admin statistics.
pub mod audit;
/// Credentials, per-player state machine, and flow orchestration.
pub mod auth;
/// Authoritative time source.
pub mod clock;
/// Engine configuration and validation.
pub mod config;
/// Persistence contracts and backends.
pub mod db;
/// Runtime-toggleable diagnostics.
pub mod diag;
/// Engine wiring and the admin surface.
pub mod engine;
/// Optional permission-system bridge.
pub mod integration;
/// Cooldown and rate-limiting primitives.
pub mod security;
/// Session lifecycle.
pub mod session;
/// TOTP second factor and recovery codes.
pub mod twofa;

pub use antibot::{AntiBotService, BanState, IpBanRecord, Verdict};
pub use audit::{AuditEntry, AuditEvent, AuditLogService, AuthStats};
pub use auth::{
    AccountRecord, AuthError, AuthPhase, AuthResult, AuthService, CredentialHasher, LoginOutcome,
    PasswordChangeOutcome, PlayerId, PlayerStateMap, RegisterOutcome, TwoFactorOutcome,
};
pub use clock::{Clock, SystemClock};
pub use config::EngineConfig;
pub use db::{Database, DatabaseConfig, MemoryBackend, Repositories};
pub use engine::{AuthEngine, EngineError};
pub use integration::{NoopPermissionBridge, PermissionBridge};
pub use security::{CooldownCache, RateLimiter};
pub use session::{Session, SessionService};
pub use twofa::{TotpService, TwoFactorCheck, TwoFactorSetup};
