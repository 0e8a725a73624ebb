//! Password hashing and verification.

use crate::config::HashingConfig;
use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};

use super::errors::{AuthError, AuthResult};

/// One-way credential hasher.
///
/// Produces self-describing, salted Argon2id hash strings with the work
/// factor taken from configuration. Verification reads the parameters out of
/// the hash string itself, so hashes produced under an older work factor keep
/// verifying after a configuration change.
#[derive(Clone)]
pub struct CredentialHasher {
    params: Params,
    pepper: Option<String>,
}

impl CredentialHasher {
    /// Build a hasher from the configured work factor.
    ///
    /// # Errors
    ///
    /// * `AuthError::HashingFailed` - the parameter combination is rejected
    ///   by the algorithm (caught earlier by config validation in practice)
    pub fn new(config: &HashingConfig) -> AuthResult<Self> {
        let params = Params::new(
            config.memory_kib,
            config.iterations,
            config.parallelism,
            None,
        )
        .map_err(|_| AuthError::HashingFailed)?;

        Ok(Self {
            params,
            pepper: config.pepper.clone(),
        })
    }

    /// Hash a plaintext password with a fresh random salt.
    ///
    /// The plaintext argument is never logged.
    pub fn hash(&self, password: &str) -> AuthResult<String> {
        let peppered = self.apply_pepper(password);
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());

        Ok(argon2
            .hash_password(peppered.as_bytes(), &salt)
            .map_err(|_| AuthError::HashingFailed)?
            .to_string())
    }

    /// Verify a plaintext password against a stored hash string.
    ///
    /// A malformed hash string is "no match", never an error that aborts the
    /// caller. The underlying verifier compares in constant time.
    pub fn verify(&self, password: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        let peppered = self.apply_pepper(password);
        Argon2::default()
            .verify_password(peppered.as_bytes(), &parsed)
            .is_ok()
    }

    fn apply_pepper(&self, password: &str) -> String {
        match &self.pepper {
            Some(pepper) => format!("{password}{pepper}"),
            None => password.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_hasher() -> CredentialHasher {
        // Low-cost parameters keep the suite fast
        CredentialHasher::new(&HashingConfig {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
            pepper: None,
        })
        .expect("test params are valid")
    }

    #[test]
    fn round_trip_verifies() {
        let hasher = test_hasher();
        let hash = hasher.hash("CorrectHorse1").unwrap();
        assert!(hasher.verify("CorrectHorse1", &hash));
        assert!(!hasher.verify("CorrectHorse2", &hash));
    }

    #[test]
    fn distinct_salts_both_verify() {
        let hasher = test_hasher();
        let a = hasher.hash("Same-Password9").unwrap();
        let b = hasher.hash("Same-Password9").unwrap();
        assert_ne!(a, b, "salts must differ across calls");
        assert!(hasher.verify("Same-Password9", &a));
        assert!(hasher.verify("Same-Password9", &b));
    }

    #[test]
    fn malformed_hash_is_no_match() {
        let hasher = test_hasher();
        assert!(!hasher.verify("whatever", "not-a-phc-string"));
        assert!(!hasher.verify("whatever", ""));
    }

    #[test]
    fn legacy_work_factor_still_verifies() {
        let old = CredentialHasher::new(&HashingConfig {
            memory_kib: 512,
            iterations: 1,
            parallelism: 1,
            pepper: None,
        })
        .unwrap();
        let hash = old.hash("Upgraded-Later7").unwrap();

        let new = CredentialHasher::new(&HashingConfig {
            memory_kib: 2048,
            iterations: 2,
            parallelism: 1,
            pepper: None,
        })
        .unwrap();
        assert!(new.verify("Upgraded-Later7", &hash));
    }

    #[test]
    fn pepper_changes_the_preimage() {
        let plain = test_hasher();
        let peppered = CredentialHasher::new(&HashingConfig {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
            pepper: Some("side-channel".to_string()),
        })
        .unwrap();

        let hash = peppered.hash("Secret123").unwrap();
        assert!(peppered.verify("Secret123", &hash));
        assert!(!plain.verify("Secret123", &hash));
    }
}
