//! Authentication error types.

use thiserror::Error;

/// Infrastructure errors surfaced by the authentication flows.
///
/// Validation failures (bad password, bad code, malformed input) are never
/// errors; they are typed outcomes in [`super::models`]. Everything here is
/// something the caller should treat as "try again later".
#[derive(Debug, Error)]
pub enum AuthError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] crate::db::DbError),

    /// Password hashing failed
    #[error("password hashing failed")]
    HashingFailed,

    /// Anti-bot gate could not be evaluated; callers fail closed
    #[error("anti-bot gate unavailable: {0}")]
    GateUnavailable(#[from] crate::antibot::AntiBotError),

    /// Session persistence failed
    #[error("session error: {0}")]
    Session(#[from] crate::session::SessionError),

    /// Second-factor persistence failed
    #[error("second-factor error: {0}")]
    TwoFactor(#[from] crate::twofa::TwoFactorError),
}

impl AuthError {
    /// Get a client-safe message that doesn't leak internal detail.
    ///
    /// Every variant here is infrastructure trouble; players get a uniform
    /// "try again" answer while the full error goes to the operational log.
    pub fn client_message(&self) -> String {
        "Service temporarily unavailable, please try again".to_string()
    }
}

/// Result type for authentication operations
pub type AuthResult<T> = Result<T, AuthError>;
