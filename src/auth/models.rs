//! Authentication data models.

use crate::antibot::Verdict;
use crate::session::Session;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Stable, unique player identifier assigned by the host server
pub type PlayerId = Uuid;

/// Durable credential/profile row, the system of record for a player account.
#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub player_id: PlayerId,
    pub username: String,
    /// Self-describing Argon2id hash string. The plaintext never touches
    /// storage or logs.
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_login_ip: Option<String>,
}

/// Result of a registration attempt.
///
/// Validation failures are values, not errors; only infrastructure failures
/// surface as `Err` from the service call.
#[derive(Debug, Clone)]
pub enum RegisterOutcome {
    /// Account created, player authenticated, session issued
    Registered(Session),
    /// A durable account already exists for this player
    AlreadyRegistered,
    /// Username failed format validation
    InvalidUsername(String),
    /// Password failed strength validation
    WeakPassword(String),
    /// Too soon after the previous attempt
    OnCooldown { remaining: chrono::Duration },
    /// Source IP is banned
    Banned(Verdict),
}

/// Result of a credential submission.
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    /// Credentials valid, no second factor required
    Authenticated(Session),
    /// Credentials valid, second factor pending
    AwaitingTwoFactor,
    /// No account on record for this player
    NotRegistered,
    /// Generic credential rejection
    InvalidCredentials,
    /// Player is already authenticated
    AlreadyAuthenticated,
    /// Too soon after the previous attempt
    OnCooldown { remaining: chrono::Duration },
    /// Attempt cap reached for the current window
    RateLimited,
    /// Source IP is banned
    Banned(Verdict),
}

/// Result of a second-factor submission.
#[derive(Debug, Clone)]
pub enum TwoFactorOutcome {
    /// Code accepted, player authenticated, session issued
    Authenticated(Session),
    /// Code rejected; attempts remain
    Rejected { attempts_left: u32 },
    /// Too many consecutive failures; the login attempt was abandoned
    Abandoned,
    /// Player is not awaiting a second factor
    NotAwaiting,
    /// Source IP is banned
    Banned(Verdict),
}

/// Result of a password change.
#[derive(Debug, Clone)]
pub enum PasswordChangeOutcome {
    /// Password updated, other sessions invalidated
    Changed,
    /// Current password did not verify
    WrongPassword,
    /// New password failed strength validation
    WeakPassword(String),
    /// Player must be authenticated to change their password
    NotAuthenticated,
    /// No account on record for this player
    NotRegistered,
}
