//! PostgreSQL adapters for `StockLock`.
//!
//! [`PostgresResourceStore`] implements the resource store over the `stock`
//! table (row locks via `SELECT ... FOR UPDATE`, version-conditioned
//! `UPDATE`s). [`PostgresAdvisoryLocks`] implements the advisory lock service
//! with `pg_advisory_lock` on connections it owns exclusively.

mod advisory;
mod store;

use std::time::Duration;

use nutype::nutype;
use sqlx::{Pool, Postgres, postgres::PgPoolOptions};
use stocklock_types::{Operation, StoreError};
use thiserror::Error;
use tracing::error;

pub use advisory::{PostgresAdvisoryLocks, PostgresAdvisorySession};
pub use store::{PostgresResourceStore, PostgresTransaction};

#[derive(Debug, Error)]
pub enum PostgresStoreError {
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    #[error("postgres did not answer a ping")]
    PingFailed(#[source] sqlx::Error),

    #[error("postgres migration failed")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),
}

/// Maximum number of database connections in the pool.
///
/// MaxConnections represents the connection pool size limit. It must be at least 1,
/// enforced by using NonZeroU32 as the underlying type.
///
/// # Examples
///
/// ```ignore
/// use stocklock_postgres::MaxConnections;
/// use std::num::NonZeroU32;
///
/// let small_pool = MaxConnections::new(NonZeroU32::new(5).expect("5 is non-zero"));
/// let large_pool = MaxConnections::new(NonZeroU32::new(50).expect("50 is non-zero"));
/// ```
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(std::num::NonZeroU32);

/// Configuration for a PostgreSQL connection pool.
///
/// Used for both the resource store pool and the advisory lock pool. The two
/// must be separate pools: every caller waiting for an advisory lock pins a
/// connection, and the holder still needs one to run its critical section.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: std::num::NonZeroU32 = match std::num::NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600), // 10 minutes
        }
    }
}

async fn connect(
    connection_string: String,
    config: PostgresConfig,
) -> Result<Pool<Postgres>, PostgresStoreError> {
    let max_connections: std::num::NonZeroU32 = config.max_connections.into();
    PgPoolOptions::new()
        .max_connections(max_connections.get())
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(&connection_string)
        .await
        .map_err(PostgresStoreError::ConnectionFailed)
}

fn map_sqlx_error(error: sqlx::Error, operation: Operation) -> StoreError {
    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );
    StoreError::StoreFailure { operation }
}
