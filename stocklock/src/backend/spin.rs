use std::time::Duration;

use stocklock_types::{KeyValueService, LockBackend, LockError, LockHandle, LockKey, OwnerToken};
use tracing::{debug, instrument, trace, warn};

/// How a spin lock removes its entry on release.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Delete only while the entry still carries this acquisition's owner token.
    #[default]
    Fenced,
    /// Delete the key whoever holds it.
    ///
    /// A release issued after this holder's lease expired deletes the next
    /// holder's entry and breaks mutual exclusion.
    Unconditional,
}

/// Configuration for [`SpinLockBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinLockConfig {
    /// Sleep between acquisition attempts (default: 100 ms).
    pub retry_interval: Duration,
    /// Time-to-live of the lock entry (default: 3000 ms).
    pub lease: Duration,
    /// Release behaviour (default: fenced).
    pub release_mode: ReleaseMode,
}

impl Default for SpinLockConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(100),
            lease: Duration::from_millis(3000),
            release_mode: ReleaseMode::Fenced,
        }
    }
}

impl SpinLockConfig {
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_release_mode(mut self, release_mode: ReleaseMode) -> Self {
        self.release_mode = release_mode;
        self
    }
}

/// Distributed lock that polls a set-if-absent key until it gets it.
///
/// Acquisition never gives up. The entry's time-to-live bounds how long a
/// crashed holder blocks everyone else.
#[derive(Debug, Clone)]
pub struct SpinLockBackend<K> {
    service: K,
    config: SpinLockConfig,
}

impl<K: KeyValueService> SpinLockBackend<K> {
    pub fn new(service: K) -> Self {
        Self::with_config(service, SpinLockConfig::default())
    }

    pub fn with_config(service: K, config: SpinLockConfig) -> Self {
        Self { service, config }
    }

    pub fn service(&self) -> &K {
        &self.service
    }
}

impl<K: KeyValueService> LockBackend for SpinLockBackend<K> {
    type Handle = LockHandle;

    #[instrument(name = "spin_lock.acquire", skip(self))]
    async fn acquire(&self, key: &LockKey) -> Result<LockHandle, LockError> {
        let mut attempts: u64 = 1;
        loop {
            if let Some(handle) = self.try_acquire(key).await? {
                debug!(key = %key, attempts, "[spin_lock.acquired] lock entry created");
                return Ok(handle);
            }

            trace!(key = %key, attempts, "[spin_lock.spinning] lock busy, sleeping");
            tokio::time::sleep(self.config.retry_interval).await;
            attempts = attempts.saturating_add(1);
        }
    }

    async fn try_acquire(&self, key: &LockKey) -> Result<Option<LockHandle>, LockError> {
        let owner = OwnerToken::generate();
        let created = self
            .service
            .set_if_absent(key.as_ref(), &owner.to_string(), self.config.lease)
            .await?;

        Ok(created.then(|| LockHandle::leased(key.clone(), owner, self.config.lease)))
    }

    #[instrument(name = "spin_lock.release", skip(self, handle), fields(key = %handle.key()))]
    async fn release(&self, handle: LockHandle) -> Result<(), LockError> {
        let key = handle.key();
        match self.config.release_mode {
            ReleaseMode::Fenced => {
                let deleted = self
                    .service
                    .delete_if_equals(key.as_ref(), &handle.owner().to_string())
                    .await?;
                if !deleted {
                    warn!(
                        key = %key,
                        "[spin_lock.not_held] lease expired before release, entry left alone"
                    );
                    return Err(LockError::NotHeld { key: key.clone() });
                }
            }
            ReleaseMode::Unconditional => {
                if !self.service.delete(key.as_ref()).await? {
                    debug!(key = %key, "[spin_lock.already_gone] entry expired before release");
                }
            }
        }

        debug!(key = %key, "[spin_lock.released] lock entry deleted");
        Ok(())
    }
}
