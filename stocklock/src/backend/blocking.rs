use std::sync::Arc;
use std::time::Duration;

use stocklock_types::{KeyValueService, LockBackend, LockError, LockHandle, LockKey, OwnerToken};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::waiters::Waiters;

/// Configuration for [`BlockingLockBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockingLockConfig {
    /// Longest a caller waits for the lock (default: 5 seconds).
    pub wait_timeout: Duration,
    /// Time-to-live of a held lock (default: 1 second).
    pub lease: Duration,
}

impl Default for BlockingLockConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(5),
            lease: Duration::from_secs(1),
        }
    }
}

impl BlockingLockConfig {
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

/// Channel on which releases of `key` are announced.
pub fn release_channel(key: &LockKey) -> String {
    format!("{key}:released")
}

/// Distributed lock whose waiters sleep until a release is announced.
///
/// Waiters join the key's release subscription before their first attempt so
/// a release between a failed attempt and the wait is never missed. Within one
/// backend (and its clones) each release wakes a single waiter. Each wait is
/// bounded by the holder's remaining lease, so a crashed holder that never
/// publishes only delays waiters until its entry expires.
#[derive(Debug, Clone)]
pub struct BlockingLockBackend<K> {
    service: K,
    config: BlockingLockConfig,
    waiters: Arc<Waiters>,
}

impl<K: KeyValueService> BlockingLockBackend<K> {
    pub fn new(service: K) -> Self {
        Self::with_config(service, BlockingLockConfig::default())
    }

    pub fn with_config(service: K, config: BlockingLockConfig) -> Self {
        Self {
            service,
            config,
            waiters: Arc::new(Waiters::default()),
        }
    }

    pub fn service(&self) -> &K {
        &self.service
    }

    /// Number of lock keys this backend is currently subscribed to.
    pub fn subscribed_keys(&self) -> usize {
        self.waiters.subscribed_keys()
    }
}

impl<K> LockBackend for BlockingLockBackend<K>
where
    K: KeyValueService,
    K::Subscription: 'static,
{
    type Handle = LockHandle;

    #[instrument(name = "blocking_lock.acquire", skip(self))]
    async fn acquire(&self, key: &LockKey) -> Result<LockHandle, LockError> {
        let started = Instant::now();
        let deadline = started + self.config.wait_timeout;
        let channel = release_channel(key);
        let mut waiter = self.waiters.register(&self.service, key, &channel).await?;

        loop {
            if let Some(handle) = self.try_acquire(key).await? {
                debug!(
                    key = %key,
                    waited_ms = started.elapsed().as_millis(),
                    "[blocking_lock.acquired] lock entry created"
                );
                return Ok(handle);
            }

            let now = Instant::now();
            if now >= deadline {
                let waited = now.duration_since(started);
                warn!(
                    key = %key,
                    waited_ms = waited.as_millis(),
                    "[blocking_lock.timeout] gave up waiting for lock"
                );
                return Err(LockError::AcquisitionTimeout {
                    key: key.clone(),
                    waited,
                });
            }

            // Entry vanished between the attempt and this check: try again at once.
            let Some(holder_ttl) = self.service.time_to_live(key.as_ref()).await? else {
                continue;
            };

            if waiter.is_closed() {
                debug!(key = %key, "[blocking_lock.resubscribe] subscription closed");
                waiter = self.waiters.register(&self.service, key, &channel).await?;
                continue;
            }

            let wait = deadline.duration_since(now).min(holder_ttl);
            if tokio::time::timeout(wait, waiter.notified()).await.is_ok() {
                debug!(key = %key, "[blocking_lock.woken] release handed to this waiter");
            }
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

    #[instrument(name = "blocking_lock.release", skip(self, handle), fields(key = %handle.key()))]
    async fn release(&self, handle: LockHandle) -> Result<(), LockError> {
        let key = handle.key();
        let owner = handle.owner().to_string();

        if !self.service.delete_if_equals(key.as_ref(), &owner).await? {
            warn!(
                key = %key,
                "[blocking_lock.not_held] lease expired before release, entry left alone"
            );
            return Err(LockError::NotHeld { key: key.clone() });
        }

        // The entry is gone either way; waiters fall back to their bounded wait.
        if let Err(error) = self.service.publish(&release_channel(key), &owner).await {
            warn!(
                key = %key,
                error = %error,
                "[blocking_lock.publish_failed] release not announced"
            );
        }

        debug!(key = %key, "[blocking_lock.released] lock entry deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use stocklock_memory::{InMemoryKeyValue, InMemorySubscription};
    use tracing_test::traced_test;

    fn key() -> LockKey {
        LockKey::try_new("stock:9").expect("valid key")
    }

    #[test]
    fn release_channel_is_derived_from_the_key() {
        assert_eq!(release_channel(&key()), "stock:9:released");
    }

    #[traced_test]
    #[tokio::test]
    async fn acquire_times_out_with_a_typed_error() {
        // Given: a holder with a lease longer than the waiter's patience
        let kv = InMemoryKeyValue::new();
        let holder = BlockingLockBackend::with_config(
            kv.clone(),
            BlockingLockConfig::default().with_lease(Duration::from_secs(10)),
        );
        let _held = holder.acquire(&key()).await.expect("first acquire");
        let waiter = BlockingLockBackend::with_config(
            kv,
            BlockingLockConfig::default().with_wait_timeout(Duration::from_millis(100)),
        );

        // When: the waiter tries to acquire
        let result = waiter.acquire(&key()).await;

        // Then: it fails with AcquisitionTimeout instead of silently returning
        match result {
            Err(LockError::AcquisitionTimeout { key: timed_out, waited }) => {
                assert_eq!(timed_out, key());
                assert!(waited >= Duration::from_millis(100));
            }
            other => panic!("expected AcquisitionTimeout, got {other:?}"),
        }
        assert!(logs_contain("[blocking_lock.timeout]"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn waiter_is_woken_by_release_before_the_lease_ends() {
        // Given: a holder with a long lease and a waiter blocked on it
        let kv = InMemoryKeyValue::new();
        let config = BlockingLockConfig::default().with_lease(Duration::from_secs(10));
        let backend = BlockingLockBackend::with_config(kv, config);
        let held = backend.acquire(&key()).await.expect("first acquire");

        let waiter = backend.clone();
        let started = std::time::Instant::now();
        let waiting = tokio::spawn(async move { waiter.acquire(&key()).await });

        // When: the holder releases shortly after
        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.release(held).await.expect("release");

        // Then: the waiter gets the lock long before the 10 s lease would expire
        let acquired = waiting.await.expect("waiter task").expect("waiter acquires");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(acquired.key(), &key());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn waiter_recovers_after_a_holder_crashes() {
        // Given: a holder that never releases, with a short lease
        let backend = BlockingLockBackend::with_config(
            InMemoryKeyValue::new(),
            BlockingLockConfig::default().with_lease(Duration::from_millis(100)),
        );
        let _crashed = backend.acquire(&key()).await.expect("first acquire");

        // When: another caller waits (no release is ever published)
        let result = backend.acquire(&key()).await;

        // Then: it acquires once the lease expires
        assert!(result.is_ok());
    }

    /// Key-value service that counts set-if-absent attempts.
    #[derive(Clone, Default)]
    struct CountingKeyValue {
        inner: InMemoryKeyValue,
        attempts: Arc<AtomicUsize>,
    }

    impl KeyValueService for CountingKeyValue {
        type Subscription = InMemorySubscription;

        async fn set_if_absent(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> Result<bool, LockError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<bool, LockError> {
            self.inner.delete(key).await
        }

        async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, LockError> {
            self.inner.delete_if_equals(key, expected).await
        }

        async fn time_to_live(&self, key: &str) -> Result<Option<Duration>, LockError> {
            self.inner.time_to_live(key).await
        }

        async fn publish(&self, channel: &str, message: &str) -> Result<(), LockError> {
            self.inner.publish(channel, message).await
        }

        async fn subscribe(&self, channel: &str) -> Result<InMemorySubscription, LockError> {
            self.inner.subscribe(channel).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn each_release_wakes_a_single_waiter() {
        // Given: a long-lease holder and five parked waiters
        let kv = CountingKeyValue::default();
        let backend = BlockingLockBackend::with_config(
            kv.clone(),
            BlockingLockConfig::default()
                .with_lease(Duration::from_secs(10))
                .with_wait_timeout(Duration::from_secs(10)),
        );
        let held = backend.acquire(&key()).await.expect("first acquire");
        let waiting: Vec<_> = (0..5)
            .map(|_| {
                let waiter = backend.clone();
                tokio::spawn(async move { waiter.acquire(&key()).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.subscribed_keys(), 1);
        kv.attempts.store(0, Ordering::SeqCst);

        // When: the holder releases once
        backend.release(held).await.expect("release");
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Then: exactly one waiter tried, and it got the lock
        assert_eq!(kv.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(waiting.iter().filter(|task| task.is_finished()).count(), 1);
        for task in waiting {
            task.abort();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscription_ends_with_the_last_waiter() {
        // Given: a held lock and a waiter that gives up
        let backend = BlockingLockBackend::with_config(
            InMemoryKeyValue::new(),
            BlockingLockConfig::default()
                .with_lease(Duration::from_secs(10))
                .with_wait_timeout(Duration::from_millis(50)),
        );
        let _held = backend.acquire(&key()).await.expect("first acquire");

        // When: the waiter times out
        let result = backend.acquire(&key()).await;

        // Then: nothing stays subscribed for that key
        assert!(matches!(result, Err(LockError::AcquisitionTimeout { .. })));
        assert_eq!(backend.subscribed_keys(), 0);
    }

    #[tokio::test]
    async fn release_after_lease_expiry_reports_not_held() {
        let backend = BlockingLockBackend::with_config(
            InMemoryKeyValue::new(),
            BlockingLockConfig::default().with_lease(Duration::from_millis(20)),
        );
        let handle = backend.acquire(&key()).await.expect("acquire");
        tokio::time::sleep(Duration::from_millis(60)).await;

        let result = backend.release(handle).await;

        assert_eq!(result, Err(LockError::NotHeld { key: key() }));
    }
}
