//! Engine configuration management.
//!
//! Consolidates all tunable thresholds and provides validated configuration
//! loaded from environment variables. Every duration is expressed in seconds
//! to keep the env surface uniform.

use std::env;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is out of its accepted range
    #[error("invalid configuration for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Complete engine configuration.
///
/// All thresholds consumed by the services live here so a single
/// [`crate::engine::AuthEngine::reload`] call can re-derive every
/// configuration-dependent piece of state without dropping sessions.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Password hashing work factor
    pub hashing: HashingConfig,
    /// Session lifetime and renewal policy
    pub session: SessionConfig,
    /// Second-factor verification policy
    pub two_factor: TwoFactorConfig,
    /// Login attempt rate limiting
    pub rate_limit: RateLimitConfig,
    /// Per-action cooldowns
    pub cooldown: CooldownConfig,
    /// Anti-bot scoring and ban escalation
    pub antibot: AntiBotConfig,
    /// Bounded audit queue capacity
    pub audit_queue_capacity: usize,
    /// Grace period before an in-memory auth entry is evicted after disconnect
    pub eviction_grace_secs: u64,
    /// Verbose diagnostics on startup
    pub debug: bool,
}

/// Argon2id work factor parameters
#[derive(Debug, Clone)]
pub struct HashingConfig {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of iterations
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
    /// Optional server-side pepper appended to every password before hashing
    pub pepper: Option<String>,
}

/// Session lifetime policy
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long an issued session stays valid
    pub lifetime_secs: u64,
    /// A session may only be extended within this window before its expiry
    pub renewal_window_secs: u64,
}

/// Second-factor policy
#[derive(Debug, Clone)]
pub struct TwoFactorConfig {
    /// Accepted time-step skew on either side of the current step
    pub skew_steps: u8,
    /// Consecutive bad codes before the login attempt is abandoned
    pub max_consecutive_failures: u32,
    /// Recovery codes issued at enrollment
    pub recovery_code_count: usize,
}

/// Login attempt rate limiting
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum attempts allowed in window
    pub max_attempts: u32,
    /// Time window in seconds
    pub window_secs: u64,
}

/// Per-action cooldown durations
#[derive(Debug, Clone)]
pub struct CooldownConfig {
    /// Minimum spacing between login attempts per player
    pub login_secs: u64,
    /// Minimum spacing between registration attempts per player
    pub register_secs: u64,
}

/// Anti-bot scoring and ban escalation policy.
///
/// Ban duration for the nth violation is
/// `base_ban_secs * escalation_factor^(n-1)`; past `max_escalations`
/// violations within `violation_memory_secs` the ban becomes permanent.
#[derive(Debug, Clone)]
pub struct AntiBotConfig {
    /// Failures within the window that trigger a ban
    pub failure_threshold: u32,
    /// Failure counting window in seconds
    pub window_secs: u64,
    /// First temp ban duration in seconds
    pub base_ban_secs: u64,
    /// Multiplier applied per repeat violation
    pub escalation_factor: u32,
    /// Violations after which the ban converts to permanent
    pub max_escalations: u32,
    /// How long a violation counts towards escalation
    pub violation_memory_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hashing: HashingConfig {
                memory_kib: 19 * 1024,
                iterations: 2,
                parallelism: 1,
                pepper: None,
            },
            session: SessionConfig {
                lifetime_secs: 12 * 3600,
                renewal_window_secs: 3600,
            },
            two_factor: TwoFactorConfig {
                skew_steps: 1,
                max_consecutive_failures: 3,
                recovery_code_count: 8,
            },
            rate_limit: RateLimitConfig {
                max_attempts: 5,
                window_secs: 60,
            },
            cooldown: CooldownConfig {
                login_secs: 3,
                register_secs: 10,
            },
            antibot: AntiBotConfig {
                failure_threshold: 10,
                window_secs: 60,
                base_ban_secs: 300,
                escalation_factor: 2,
                max_escalations: 4,
                violation_memory_secs: 24 * 3600,
            },
            audit_queue_capacity: 1024,
            eviction_grace_secs: 120,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a provided value fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            hashing: HashingConfig {
                memory_kib: parse_env_or("AUTH_HASH_MEMORY_KIB", defaults.hashing.memory_kib),
                iterations: parse_env_or("AUTH_HASH_ITERATIONS", defaults.hashing.iterations),
                parallelism: parse_env_or("AUTH_HASH_PARALLELISM", defaults.hashing.parallelism),
                pepper: env::var("AUTH_PASSWORD_PEPPER").ok().filter(|p| !p.is_empty()),
            },
            session: SessionConfig {
                lifetime_secs: parse_env_or("AUTH_SESSION_LIFETIME_SECS", defaults.session.lifetime_secs),
                renewal_window_secs: parse_env_or(
                    "AUTH_SESSION_RENEWAL_WINDOW_SECS",
                    defaults.session.renewal_window_secs,
                ),
            },
            two_factor: TwoFactorConfig {
                skew_steps: parse_env_or("AUTH_2FA_SKEW_STEPS", defaults.two_factor.skew_steps),
                max_consecutive_failures: parse_env_or(
                    "AUTH_2FA_MAX_FAILURES",
                    defaults.two_factor.max_consecutive_failures,
                ),
                recovery_code_count: parse_env_or(
                    "AUTH_2FA_RECOVERY_CODES",
                    defaults.two_factor.recovery_code_count,
                ),
            },
            rate_limit: RateLimitConfig {
                max_attempts: parse_env_or("AUTH_RATE_LIMIT_ATTEMPTS", defaults.rate_limit.max_attempts),
                window_secs: parse_env_or("AUTH_RATE_LIMIT_WINDOW_SECS", defaults.rate_limit.window_secs),
            },
            cooldown: CooldownConfig {
                login_secs: parse_env_or("AUTH_LOGIN_COOLDOWN_SECS", defaults.cooldown.login_secs),
                register_secs: parse_env_or("AUTH_REGISTER_COOLDOWN_SECS", defaults.cooldown.register_secs),
            },
            antibot: AntiBotConfig {
                failure_threshold: parse_env_or("ANTIBOT_FAILURE_THRESHOLD", defaults.antibot.failure_threshold),
                window_secs: parse_env_or("ANTIBOT_WINDOW_SECS", defaults.antibot.window_secs),
                base_ban_secs: parse_env_or("ANTIBOT_BASE_BAN_SECS", defaults.antibot.base_ban_secs),
                escalation_factor: parse_env_or("ANTIBOT_ESCALATION_FACTOR", defaults.antibot.escalation_factor),
                max_escalations: parse_env_or("ANTIBOT_MAX_ESCALATIONS", defaults.antibot.max_escalations),
                violation_memory_secs: parse_env_or(
                    "ANTIBOT_VIOLATION_MEMORY_SECS",
                    defaults.antibot.violation_memory_secs,
                ),
            },
            audit_queue_capacity: parse_env_or("AUDIT_QUEUE_CAPACITY", defaults.audit_queue_capacity),
            eviction_grace_secs: parse_env_or("AUTH_EVICTION_GRACE_SECS", defaults.eviction_grace_secs),
            debug: parse_env_or("AUTH_DEBUG", false),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hashing.memory_kib < 8 * self.hashing.parallelism {
            return Err(ConfigError::Invalid {
                field: "hashing.memory_kib".to_string(),
                reason: "must be at least 8 KiB per lane of parallelism".to_string(),
            });
        }
        if self.hashing.iterations == 0 || self.hashing.parallelism == 0 {
            return Err(ConfigError::Invalid {
                field: "hashing".to_string(),
                reason: "iterations and parallelism must be non-zero".to_string(),
            });
        }
        if self.session.lifetime_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "session.lifetime_secs".to_string(),
                reason: "sessions must have a non-zero lifetime".to_string(),
            });
        }
        if self.session.renewal_window_secs > self.session.lifetime_secs {
            return Err(ConfigError::Invalid {
                field: "session.renewal_window_secs".to_string(),
                reason: "renewal window cannot exceed the session lifetime".to_string(),
            });
        }
        if self.rate_limit.max_attempts == 0 || self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "rate_limit".to_string(),
                reason: "max_attempts and window_secs must be non-zero".to_string(),
            });
        }
        if self.two_factor.skew_steps > 2 {
            return Err(ConfigError::Invalid {
                field: "two_factor.skew_steps".to_string(),
                reason: "skew beyond 2 steps defeats the point of TOTP".to_string(),
            });
        }
        if self.two_factor.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid {
                field: "two_factor.max_consecutive_failures".to_string(),
                reason: "must allow at least one attempt".to_string(),
            });
        }
        if self.antibot.failure_threshold == 0
            || self.antibot.window_secs == 0
            || self.antibot.base_ban_secs == 0
        {
            return Err(ConfigError::Invalid {
                field: "antibot".to_string(),
                reason: "failure_threshold, window_secs and base_ban_secs must be non-zero".to_string(),
            });
        }
        if self.antibot.escalation_factor < 1 {
            return Err(ConfigError::Invalid {
                field: "antibot.escalation_factor".to_string(),
                reason: "escalation factor must be at least 1".to_string(),
            });
        }
        if self.audit_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "audit_queue_capacity".to_string(),
                reason: "the audit queue needs capacity for at least one entry".to_string(),
            });
        }
        Ok(())
    }
}

/// Parse an environment variable or fall back to a default
fn parse_env_or<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().expect("defaults must validate");
    }

    #[test]
    fn rejects_zero_session_lifetime() {
        let mut config = EngineConfig::default();
        config.session.lifetime_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_renewal_window_longer_than_lifetime() {
        let mut config = EngineConfig::default();
        config.session.lifetime_secs = 60;
        config.session.renewal_window_secs = 120;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_undersized_hash_memory() {
        let mut config = EngineConfig::default();
        config.hashing.memory_kib = 4;
        config.hashing.parallelism = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_excessive_totp_skew() {
        let mut config = EngineConfig::default();
        config.two_factor.skew_steps = 5;
        assert!(config.validate().is_err());
    }
}
