use std::time::Duration;

use stocklock_types::{
    AdvisoryLockService, AdvisorySession, LockBackend, LockError, LockHandle, LockKey, OwnerToken,
};
use tracing::{debug, instrument};

/// Configuration for [`AdvisoryLockBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdvisoryLockConfig {
    /// Give up waiting for the lock after this long. `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
}

impl AdvisoryLockConfig {
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }
}

/// A held advisory lock together with the session that owns it.
///
/// The lock lives exactly as long as the session; dropping the handle without
/// releasing it closes the session, and the lock service reclaims the lock.
pub struct AdvisoryLockHandle<S> {
    lock: LockHandle,
    session: S,
}

impl<S> AsRef<LockHandle> for AdvisoryLockHandle<S> {
    fn as_ref(&self) -> &LockHandle {
        &self.lock
    }
}

/// Named mutex backed by an [`AdvisoryLockService`].
///
/// Every acquisition opens its own session, separate from the resource
/// store's unit of work, so the lock and the decrement commit independently.
#[derive(Debug, Clone)]
pub struct AdvisoryLockBackend<A> {
    service: A,
    config: AdvisoryLockConfig,
}

impl<A: AdvisoryLockService> AdvisoryLockBackend<A> {
    pub fn new(service: A) -> Self {
        Self::with_config(service, AdvisoryLockConfig::default())
    }

    pub fn with_config(service: A, config: AdvisoryLockConfig) -> Self {
        Self { service, config }
    }

    pub fn service(&self) -> &A {
        &self.service
    }
}

impl<A: AdvisoryLockService> LockBackend for AdvisoryLockBackend<A> {
    type Handle = AdvisoryLockHandle<A::Session>;

    #[instrument(name = "advisory_lock.acquire", skip(self))]
    async fn acquire(&self, key: &LockKey) -> Result<Self::Handle, LockError> {
        let mut session = self.service.obtain_session().await?;
        session.lock(key, self.config.acquire_timeout).await?;

        debug!(key = %key, "[advisory_lock.acquired] named lock granted");
        Ok(AdvisoryLockHandle {
            lock: LockHandle::unleased(key.clone(), OwnerToken::generate()),
            session,
        })
    }

    #[instrument(name = "advisory_lock.try_acquire", skip(self))]
    async fn try_acquire(&self, key: &LockKey) -> Result<Option<Self::Handle>, LockError> {
        let mut session = self.service.obtain_session().await?;
        if !session.try_lock(key).await? {
            debug!(key = %key, "[advisory_lock.busy] named lock held elsewhere");
            return Ok(None);
        }

        Ok(Some(AdvisoryLockHandle {
            lock: LockHandle::unleased(key.clone(), OwnerToken::generate()),
            session,
        }))
    }

    #[instrument(name = "advisory_lock.release", skip(self, handle), fields(key = %handle.lock.key()))]
    async fn release(&self, handle: Self::Handle) -> Result<(), LockError> {
        let AdvisoryLockHandle { lock, mut session } = handle;
        session.unlock(lock.key()).await?;

        debug!(key = %lock.key(), "[advisory_lock.released] named lock released");
        Ok(())
    }
}
