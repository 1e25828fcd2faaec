use crate::lock::{LockError, LockKey};
use std::future::Future;
use std::time::Duration;

/// Database-provided named mutex service.
///
/// Advisory locks are scoped to the session that took them, so every
/// acquisition gets its own [`AdvisorySession`] that is never shared with the
/// transaction doing the decrement.
pub trait AdvisoryLockService: Send + Sync {
    /// Session type handed out by [`AdvisoryLockService::obtain_session`].
    type Session: AdvisorySession;

    /// Open a dedicated session.
    fn obtain_session(&self) -> impl Future<Output = Result<Self::Session, LockError>> + Send;
}

/// A dedicated session able to hold named locks.
///
/// Dropping a session releases every lock it still holds.
pub trait AdvisorySession: Send {
    /// Wait for the named lock.
    ///
    /// With `timeout` set, gives up with [`LockError::AcquisitionTimeout`]
    /// once it elapses; without one, waits indefinitely.
    fn lock(
        &mut self,
        key: &LockKey,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<(), LockError>> + Send;

    /// Single attempt. Returns `true` if the lock was taken.
    fn try_lock(&mut self, key: &LockKey) -> impl Future<Output = Result<bool, LockError>> + Send;

    /// Release the named lock. [`LockError::NotHeld`] if this session does not hold it.
    fn unlock(&mut self, key: &LockKey) -> impl Future<Output = Result<(), LockError>> + Send;
}
