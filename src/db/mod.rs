//! Persistence layer: connection pooling, repository contracts, and backends.
//!
//! The durable repository is the system of record; in-memory caches elsewhere
//! in the engine are rebuildable from it and never authoritative across a
//! restart. Two backends implement the repository traits: a PostgreSQL
//! implementation in [`repository`] and an in-memory implementation in
//! [`memory`] that runs the whole engine without a database (tests, embedded
//! hosts, throwaway servers).

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use thiserror::Error;

pub mod config;
pub mod memory;
pub mod repository;

pub use config::DatabaseConfig;
pub use memory::MemoryBackend;
pub use repository::{
    AccountRepository, AuditRepository, BanRepository, PgAccountRepository, PgAuditRepository,
    PgBanRepository, PgSessionRepository, PgTwoFactorRepository, Repositories, SessionRepository,
    TwoFactorRepository,
};

/// Persistence errors
#[derive(Debug, Error)]
pub enum DbError {
    /// Database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// A stored value failed a sanity check on load
    #[error("data corruption: {0}")]
    Corruption(String),

    /// A uniqueness constraint rejected the write
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Result type for persistence operations
pub type DbResult<T> = Result<T, DbError>;

/// Database connection pool wrapper
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    ///
    /// # Errors
    ///
    /// Returns the underlying `sqlx` error if the pool cannot be established.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database connection is healthy.
    ///
    /// # Errors
    ///
    /// Returns the underlying `sqlx` error if the probe query fails.
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the database connection pool
    pub async fn close(self) {
        self.pool.close().await;
    }
}
