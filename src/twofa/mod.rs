//! Second-factor (TOTP) enrollment and verification.
//!
//! Secrets are issued in a pending state and only committed once the player
//! proves possession by submitting a first valid code. Recovery codes are
//! single-use substitutes stored as digests; the plaintext is shown exactly
//! once at enrollment. A per-player last-consumed-step guard rejects replay
//! of a valid code within its time step.

use crate::{
    auth::models::PlayerId,
    clock::Clock,
    config::TwoFactorConfig,
    db::{DbError, TwoFactorRepository},
};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use subtle::ConstantTimeEq;
use thiserror::Error;
use totp_rs::{Algorithm, Secret, TOTP};

/// Issuer label embedded in provisioning URLs
const ISSUER: &str = "SecureAuth";

/// RFC 6238 time step in seconds
const STEP_SECS: u64 = 30;

/// Recovery-code alphabet, skipping easily-confused characters
const RECOVERY_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Second-factor errors
#[derive(Debug, Error)]
pub enum TwoFactorError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] DbError),

    /// Stored secret could not be decoded
    #[error("invalid TOTP secret on record")]
    InvalidSecret,
}

/// Result type for second-factor operations
pub type TwoFactorResult<T> = Result<T, TwoFactorError>;

/// Durable second-factor state for one player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoFactorRecord {
    pub player_id: PlayerId,
    /// Base32-encoded shared secret
    pub secret: String,
    /// False while enrollment is pending confirmation
    pub confirmed: bool,
    /// SHA-256 digests of unused recovery codes, hex-encoded
    pub recovery_codes: Vec<String>,
    pub enrolled_at: DateTime<Utc>,
}

/// Returned once at enrollment; the secret and plaintext codes are never
/// available again.
#[derive(Debug, Clone)]
pub struct TwoFactorSetup {
    pub secret: String,
    pub otpauth_url: String,
    pub recovery_codes: Vec<String>,
}

/// Outcome of a second-factor verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TwoFactorCheck {
    /// Live code accepted
    Accepted,
    /// Recovery code accepted and consumed
    AcceptedRecovery { remaining: usize },
    /// Code rejected (wrong, replayed, or 2FA not active)
    Rejected,
}

impl TwoFactorCheck {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, TwoFactorCheck::Rejected)
    }
}

/// TOTP secret issuance, code verification, and recovery-code handling.
pub struct TotpService {
    repo: Arc<dyn TwoFactorRepository>,
    clock: Arc<dyn Clock>,
    config: std::sync::RwLock<TwoFactorConfig>,
    /// Last consumed time step per player, for single-use enforcement
    last_step: Mutex<HashMap<PlayerId, u64>>,
}

impl TotpService {
    pub fn new(
        repo: Arc<dyn TwoFactorRepository>,
        clock: Arc<dyn Clock>,
        config: TwoFactorConfig,
    ) -> Self {
        Self {
            repo,
            clock,
            config: std::sync::RwLock::new(config),
            last_step: Mutex::new(HashMap::new()),
        }
    }

    /// Generate a fresh secret and recovery codes, persisted in pending
    /// (unconfirmed) state. Re-enrolling replaces any prior state.
    ///
    /// # Errors
    ///
    /// * `TwoFactorError::Database` - the pending record could not be stored
    pub async fn enroll(&self, player_id: PlayerId, account_name: &str) -> TwoFactorResult<TwoFactorSetup> {
        let mut secret_bytes = [0u8; 20];
        rand::rng().fill(&mut secret_bytes[..]);
        let Secret::Encoded(secret) = Secret::Raw(secret_bytes.to_vec()).to_encoded() else {
            return Err(TwoFactorError::InvalidSecret);
        };

        let code_count = {
            let config = self.config.read().expect("twofa config lock poisoned");
            config.recovery_code_count
        };
        let recovery_codes: Vec<String> = (0..code_count).map(|_| generate_recovery_code()).collect();
        let digests = recovery_codes.iter().map(|code| digest_code(code)).collect();

        let record = TwoFactorRecord {
            player_id,
            secret: secret.clone(),
            confirmed: false,
            recovery_codes: digests,
            enrolled_at: self.clock.now(),
        };
        self.repo.upsert(&record).await?;

        let otpauth_url = format!(
            "otpauth://totp/{ISSUER}:{account_name}?secret={secret}&issuer={ISSUER}&algorithm=SHA1&digits=6&period={STEP_SECS}"
        );

        Ok(TwoFactorSetup {
            secret,
            otpauth_url,
            recovery_codes,
        })
    }

    /// Verify the first code against the pending secret and commit it as
    /// active. Returns `false` if nothing is pending or the code is wrong.
    ///
    /// # Errors
    ///
    /// * `TwoFactorError::Database` - record lookup or activation failed
    pub async fn confirm_enrollment(&self, player_id: PlayerId, code: &str) -> TwoFactorResult<bool> {
        let Some(mut record) = self.repo.find(player_id).await? else {
            return Ok(false);
        };
        if record.confirmed {
            return Ok(false);
        }

        let now = self.clock.now_unix();
        if !self.totp_for(&record.secret)?.check(code.trim(), now) {
            return Ok(false);
        }

        record.confirmed = true;
        self.repo.upsert(&record).await?;
        self.consume_step(player_id, now / STEP_SECS);
        Ok(true)
    }

    /// Check a live code against the active secret, or consume a matching
    /// recovery code. Verification failure is a value, never an error.
    ///
    /// # Errors
    ///
    /// * `TwoFactorError::Database` - record lookup or recovery-code
    ///   consumption failed
    pub async fn verify(&self, player_id: PlayerId, code: &str) -> TwoFactorResult<TwoFactorCheck> {
        let Some(mut record) = self.repo.find(player_id).await? else {
            return Ok(TwoFactorCheck::Rejected);
        };
        if !record.confirmed {
            return Ok(TwoFactorCheck::Rejected);
        }

        let code = code.trim();
        if code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit()) {
            let now = self.clock.now_unix();
            if self.totp_for(&record.secret)?.check(code, now) {
                let step = now / STEP_SECS;
                if self.is_replay(player_id, step) {
                    return Ok(TwoFactorCheck::Rejected);
                }
                self.consume_step(player_id, step);
                return Ok(TwoFactorCheck::Accepted);
            }
            return Ok(TwoFactorCheck::Rejected);
        }

        // Not shaped like a TOTP code; try the recovery codes
        let digest = digest_code(code);
        let matched = record
            .recovery_codes
            .iter()
            .position(|stored| constant_time_eq(stored, &digest));
        match matched {
            Some(index) => {
                record.recovery_codes.remove(index);
                let remaining = record.recovery_codes.len();
                self.repo.upsert(&record).await?;
                Ok(TwoFactorCheck::AcceptedRecovery { remaining })
            }
            None => Ok(TwoFactorCheck::Rejected),
        }
    }

    /// Whether the player has an active (confirmed) second factor.
    pub async fn is_enabled(&self, player_id: PlayerId) -> TwoFactorResult<bool> {
        Ok(self
            .repo
            .find(player_id)
            .await?
            .is_some_and(|record| record.confirmed))
    }

    /// Remove the secret and all recovery codes.
    ///
    /// # Errors
    ///
    /// * `TwoFactorError::Database` - the record could not be removed
    pub async fn disable(&self, player_id: PlayerId) -> TwoFactorResult<()> {
        self.repo.delete(player_id).await?;
        self.last_step
            .lock()
            .expect("replay guard lock poisoned")
            .remove(&player_id);
        Ok(())
    }

    /// Apply a new skew/recovery policy to subsequent operations.
    pub fn reconfigure(&self, config: TwoFactorConfig) {
        *self.config.write().expect("twofa config lock poisoned") = config;
    }

    fn totp_for(&self, secret: &str) -> TwoFactorResult<TOTP> {
        let skew = {
            let config = self.config.read().expect("twofa config lock poisoned");
            config.skew_steps
        };
        let bytes = Secret::Encoded(secret.to_string())
            .to_bytes()
            .map_err(|_| TwoFactorError::InvalidSecret)?;
        TOTP::new(Algorithm::SHA1, 6, skew, STEP_SECS, bytes)
            .map_err(|_| TwoFactorError::InvalidSecret)
    }

    fn is_replay(&self, player_id: PlayerId, step: u64) -> bool {
        self.last_step
            .lock()
            .expect("replay guard lock poisoned")
            .get(&player_id)
            .is_some_and(|last| *last >= step)
    }

    fn consume_step(&self, player_id: PlayerId, step: u64) {
        self.last_step
            .lock()
            .expect("replay guard lock poisoned")
            .insert(player_id, step);
    }
}

fn generate_recovery_code() -> String {
    let mut rng = rand::rng();
    let mut halves = [[0u8; 4]; 2];
    for half in &mut halves {
        for slot in half.iter_mut() {
            *slot = RECOVERY_ALPHABET[rng.random_range(0..RECOVERY_ALPHABET.len())];
        }
    }
    format!(
        "{}-{}",
        String::from_utf8_lossy(&halves[0]),
        String::from_utf8_lossy(&halves[1])
    )
}

fn digest_code(code: &str) -> String {
    let normalized = code.trim().to_ascii_uppercase();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}
