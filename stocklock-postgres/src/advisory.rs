use std::collections::HashSet;
use std::time::Duration;

use sqlx::{Pool, Postgres, Row, pool::PoolConnection, query};
use stocklock_types::{AdvisoryLockService, AdvisorySession, LockError, LockKey, LockOperation};
use tracing::{debug, error, instrument, warn};

use crate::{PostgresConfig, PostgresStoreError, connect};

// Advisory locks are keyed by a 64-bit integer; the text key is hashed into it.
const LOCK: &str = "SELECT pg_advisory_lock(hashtextextended($1, 0))";
const TRY_LOCK: &str = "SELECT pg_try_advisory_lock(hashtextextended($1, 0))";
const UNLOCK: &str = "SELECT pg_advisory_unlock(hashtextextended($1, 0))";
const SET_LOCK_TIMEOUT: &str = "SELECT set_config('lock_timeout', $1, false)";

/// SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Session-scoped advisory locks on a pool of dedicated connections.
///
/// Each session checks one connection out of the pool and keeps it until the
/// session is dropped, since PostgreSQL ties advisory locks to the backend
/// that took them.
#[derive(Debug, Clone)]
pub struct PostgresAdvisoryLocks {
    pool: Pool<Postgres>,
}

impl PostgresAdvisoryLocks {
    pub async fn new<S: Into<String>>(connection_string: S) -> Result<Self, PostgresStoreError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresStoreError> {
        let pool = connect(connection_string.into(), config).await?;
        Ok(Self { pool })
    }

    /// Use an existing pool. It must not be the resource store's pool.
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

impl AdvisoryLockService for PostgresAdvisoryLocks {
    type Session = PostgresAdvisorySession;

    #[instrument(name = "postgres.obtain_session", skip(self))]
    async fn obtain_session(&self) -> Result<PostgresAdvisorySession, LockError> {
        let connection = self
            .pool
            .acquire()
            .await
            .map_err(|error| map_lock_error(error, LockOperation::OpenSession))?;

        Ok(PostgresAdvisorySession {
            connection,
            held: HashSet::new(),
        })
    }
}

/// One dedicated connection and the advisory locks it holds.
///
/// Dropping a session that still holds locks closes its connection instead
/// of returning it to the pool, so the server releases those locks.
pub struct PostgresAdvisorySession {
    connection: PoolConnection<Postgres>,
    held: HashSet<LockKey>,
}

impl PostgresAdvisorySession {
    async fn lock_with_timeout(&mut self, key: &LockKey, limit: Duration) -> Result<(), LockError> {
        query(SET_LOCK_TIMEOUT)
            .bind(lock_timeout_setting(limit))
            .execute(&mut *self.connection)
            .await
            .map_err(|error| map_lock_error(error, LockOperation::AcquireLock))?;

        let locked = query(LOCK)
            .bind(key.as_ref())
            .execute(&mut *self.connection)
            .await
            .map(drop);

        // Restore the default so the next holder of this connection waits indefinitely.
        let reset = query(SET_LOCK_TIMEOUT)
            .bind("0")
            .execute(&mut *self.connection)
            .await
            .map(drop);

        let settled = settle_timed_lock(key, limit, locked, reset);
        if settled.discard_connection {
            self.connection.close_on_drop();
        }
        settled.outcome
    }
}

/// Result of a lock attempt under `lock_timeout`.
#[derive(Debug)]
struct TimedLock {
    outcome: Result<(), LockError>,
    // The connection's lock_timeout could not be restored.
    discard_connection: bool,
}

/// Combine the lock attempt with the reset that follows it.
///
/// A granted lock stays granted when the reset fails, so the session can
/// track and later release it; the connection is then closed rather than
/// pooled with a leftover timeout.
fn settle_timed_lock(
    key: &LockKey,
    limit: Duration,
    locked: Result<(), sqlx::Error>,
    reset: Result<(), sqlx::Error>,
) -> TimedLock {
    let discard_connection = match reset {
        Ok(()) => false,
        Err(error) => {
            warn!(
                key = %key,
                error = %error,
                "[postgres.advisory_reset_failed] lock_timeout not restored, connection will be closed"
            );
            true
        }
    };

    let outcome = match locked {
        Err(sqlx::Error::Database(db_error))
            if db_error.code().as_deref() == Some(LOCK_NOT_AVAILABLE) =>
        {
            warn!(
                key = %key,
                waited = ?limit,
                "[postgres.advisory_timeout] advisory lock not granted in time"
            );
            Err(LockError::AcquisitionTimeout {
                key: key.clone(),
                waited: limit,
            })
        }
        Err(error) => Err(map_lock_error(error, LockOperation::AcquireLock)),
        Ok(()) => Ok(()),
    };

    TimedLock {
        outcome,
        discard_connection,
    }
}

impl AdvisorySession for PostgresAdvisorySession {
    #[instrument(name = "postgres.advisory_lock", skip(self))]
    async fn lock(&mut self, key: &LockKey, timeout: Option<Duration>) -> Result<(), LockError> {
        if self.held.contains(key) {
            return Ok(());
        }

        match timeout {
            Some(limit) => self.lock_with_timeout(key, limit).await?,
            None => {
                query(LOCK)
                    .bind(key.as_ref())
                    .execute(&mut *self.connection)
                    .await
                    .map_err(|error| map_lock_error(error, LockOperation::AcquireLock))?;
            }
        }

        debug!(key = %key, "[postgres.advisory_locked] advisory lock granted");
        self.held.insert(key.clone());
        Ok(())
    }

    #[instrument(name = "postgres.advisory_try_lock", skip(self))]
    async fn try_lock(&mut self, key: &LockKey) -> Result<bool, LockError> {
        if self.held.contains(key) {
            return Ok(true);
        }

        let row = query(TRY_LOCK)
            .bind(key.as_ref())
            .fetch_one(&mut *self.connection)
            .await
            .map_err(|error| map_lock_error(error, LockOperation::AcquireLock))?;
        let acquired: bool = row
            .try_get(0)
            .map_err(|error| map_lock_error(error, LockOperation::AcquireLock))?;

        if acquired {
            self.held.insert(key.clone());
        }
        Ok(acquired)
    }

    #[instrument(name = "postgres.advisory_unlock", skip(self))]
    async fn unlock(&mut self, key: &LockKey) -> Result<(), LockError> {
        let row = query(UNLOCK)
            .bind(key.as_ref())
            .fetch_one(&mut *self.connection)
            .await
            .map_err(|error| map_lock_error(error, LockOperation::ReleaseLock))?;
        let released: bool = row
            .try_get(0)
            .map_err(|error| map_lock_error(error, LockOperation::ReleaseLock))?;

        self.held.remove(key);
        if released {
            Ok(())
        } else {
            Err(LockError::NotHeld { key: key.clone() })
        }
    }
}

impl Drop for PostgresAdvisorySession {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            warn!(
                held = self.held.len(),
                "[postgres.advisory_session_dropped] closing connection to release advisory locks"
            );
            self.connection.close_on_drop();
        }
    }
}

/// `lock_timeout` value for `limit`. Zero would disable the timeout, so the
/// shortest setting is one millisecond.
fn lock_timeout_setting(limit: Duration) -> String {
    format!("{}ms", limit.as_millis().max(1))
}

fn map_lock_error(error: sqlx::Error, operation: LockOperation) -> LockError {
    error!(
        error = %error,
        operation = %operation,
        "[postgres.advisory_error] advisory lock operation failed"
    );
    LockError::BackendUnavailable {
        operation,
        detail: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_is_expressed_in_milliseconds() {
        assert_eq!(lock_timeout_setting(Duration::from_secs(2)), "2000ms");
    }

    #[test]
    fn sub_millisecond_timeouts_never_disable_the_limit() {
        assert_eq!(lock_timeout_setting(Duration::from_micros(10)), "1ms");
    }

    fn key() -> LockKey {
        LockKey::try_new("stock:1").expect("valid key")
    }

    #[test]
    fn granted_lock_survives_a_failed_reset_but_the_connection_is_discarded() {
        let settled = settle_timed_lock(
            &key(),
            Duration::from_secs(1),
            Ok(()),
            Err(sqlx::Error::PoolTimedOut),
        );

        assert_eq!(settled.outcome, Ok(()));
        assert!(settled.discard_connection);
    }

    #[test]
    fn failed_lock_and_failed_reset_discard_the_connection() {
        let settled = settle_timed_lock(
            &key(),
            Duration::from_secs(1),
            Err(sqlx::Error::PoolTimedOut),
            Err(sqlx::Error::PoolTimedOut),
        );

        assert!(matches!(
            settled.outcome,
            Err(LockError::BackendUnavailable {
                operation: LockOperation::AcquireLock,
                ..
            })
        ));
        assert!(settled.discard_connection);
    }

    #[test]
    fn clean_reset_keeps_the_connection_poolable() {
        let settled = settle_timed_lock(&key(), Duration::from_secs(1), Ok(()), Ok(()));

        assert_eq!(settled.outcome, Ok(()));
        assert!(!settled.discard_connection);
    }

    #[test]
    fn driver_failures_name_the_lock_operation() {
        let mapped = map_lock_error(sqlx::Error::PoolTimedOut, LockOperation::OpenSession);

        assert!(matches!(
            mapped,
            LockError::BackendUnavailable {
                operation: LockOperation::OpenSession,
                ..
            }
        ));
    }
}
