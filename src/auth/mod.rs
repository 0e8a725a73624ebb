//! Player authentication: credentials, per-player state, and flow
//! orchestration.
//!
//! The state machine is three phases — unauthenticated, awaiting-2FA,
//! authenticated — mutated only through compare-and-swap transitions, with
//! the orchestration in [`service`] running the full gauntlet (anti-bot gate,
//! cooldown, rate limit, credential/second-factor verification, session
//! issuance, audit) around it.

pub mod errors;
pub mod models;
pub mod password;
pub mod service;
pub mod state;

pub use errors::{AuthError, AuthResult};
pub use models::{
    AccountRecord, LoginOutcome, PasswordChangeOutcome, PlayerId, RegisterOutcome,
    TwoFactorOutcome,
};
pub use password::CredentialHasher;
pub use service::AuthService;
pub use state::{AuthPhase, PlayerAuthEntry, PlayerStateMap};
