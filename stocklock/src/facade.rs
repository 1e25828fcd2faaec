use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};

use futures::FutureExt;
use stocklock_types::{
    DecreaseError, LockBackend, LockError, LockKey, LockKeyPrefix, LockOperation, Quantity,
    ReadMode, ResourceId, ResourceStore,
};
use tokio::sync::Mutex;
use tracing::{error, instrument, warn};

use crate::backend::{AdvisoryLockBackend, BlockingLockBackend, SpinLockBackend};
use crate::decrement::decrement;

/// A strategy for decreasing stock safely under concurrency.
///
/// Every implementation guarantees that the read-validate-subtract-persist
/// cycle for one resource id never interleaves with another caller's cycle on
/// the same id, or (for the optimistic strategy) that an interleaved cycle is
/// detected and redone.
pub trait DecreaseStock: Send + Sync {
    /// Store the strategy decrements against.
    type Store: ResourceStore;

    /// Decrease the quantity of resource `id` by `amount`.
    fn decrease(
        &self,
        id: ResourceId,
        amount: Quantity,
    ) -> impl Future<Output = Result<(), DecreaseError>> + Send;

    /// The underlying store, for observers and fixtures.
    fn store(&self) -> &Self::Store;
}

/// Row-lock strategy.
///
/// The exclusive read is the acquisition; commit or rollback of the same
/// unit of work is the release. Waiting is governed by the store's own lock
/// wait policy.
#[derive(Debug, Clone)]
pub struct PessimisticLockFacade<S> {
    store: S,
}

impl<S: ResourceStore> PessimisticLockFacade<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: ResourceStore> DecreaseStock for PessimisticLockFacade<S> {
    type Store = S;

    #[instrument(name = "pessimistic.decrease", skip(self))]
    async fn decrease(&self, id: ResourceId, amount: Quantity) -> Result<(), DecreaseError> {
        decrement(&self.store, id, amount, ReadMode::Exclusive).await
    }

    fn store(&self) -> &S {
        &self.store
    }
}

/// Any explicit [`LockBackend`] composed with the plain-read decrement.
///
/// The lock is released on every exit path: success, error, panic, and a
/// caller dropping the future mid-way. A panic inside the critical section is
/// resumed once the lock is released. Releases run on a spawned task, so an
/// abandoned call still gives its lock back.
#[derive(Debug, Clone)]
pub struct LockedFacade<B, S> {
    backend: Arc<B>,
    store: S,
    prefix: LockKeyPrefix,
}

/// Named mutex strategy (session-scoped advisory lock).
pub type NamedLockFacade<A, S> = LockedFacade<AdvisoryLockBackend<A>, S>;

/// Distributed spin lock strategy.
pub type SpinLockFacade<K, S> = LockedFacade<SpinLockBackend<K>, S>;

/// Distributed blocking lock strategy.
pub type BlockingLockFacade<K, S> = LockedFacade<BlockingLockBackend<K>, S>;

impl<B: LockBackend, S: ResourceStore> LockedFacade<B, S> {
    pub fn new(backend: B, store: S) -> Self {
        Self::with_prefix(backend, store, LockKeyPrefix::default())
    }

    /// Use `prefix` instead of `stock` when deriving lock keys.
    pub fn with_prefix(backend: B, store: S, prefix: LockKeyPrefix) -> Self {
        Self {
            backend: Arc::new(backend),
            store,
            prefix,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The lock key protecting `id`.
    pub fn lock_key(&self, id: ResourceId) -> LockKey {
        LockKey::for_resource(&self.prefix, id)
    }
}

impl<B, S> DecreaseStock for LockedFacade<B, S>
where
    B: LockBackend + 'static,
    B::Handle: 'static,
    S: ResourceStore,
{
    type Store = S;

    #[instrument(name = "locked.decrease", skip(self))]
    async fn decrease(&self, id: ResourceId, amount: Quantity) -> Result<(), DecreaseError> {
        let key = self.lock_key(id);
        let handle = self.backend.acquire(&key).await?;
        let held = HeldLock::new(Arc::clone(&self.backend), key.clone(), handle);

        let outcome = AssertUnwindSafe(decrement(&self.store, id, amount, ReadMode::Plain))
            .catch_unwind()
            .await;
        let released = held.release().await;

        settle(key, outcome, released)
    }

    fn store(&self) -> &S {
        &self.store
    }
}

/// A held lock that is released from a spawned task if it is dropped unreleased.
struct HeldLock<B>
where
    B: LockBackend + 'static,
    B::Handle: 'static,
{
    backend: Arc<B>,
    key: LockKey,
    handle: Option<B::Handle>,
}

impl<B> HeldLock<B>
where
    B: LockBackend + 'static,
    B::Handle: 'static,
{
    fn new(backend: Arc<B>, key: LockKey, handle: B::Handle) -> Self {
        Self {
            backend,
            key,
            handle: Some(handle),
        }
    }

    /// Release on a spawned task and wait for it. Dropping the returned
    /// future does not stop the release.
    async fn release(mut self) -> Result<(), LockError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let backend = Arc::clone(&self.backend);

        match tokio::spawn(async move { backend.release(handle).await }).await {
            Ok(released) => released,
            Err(join_error) if join_error.is_panic() => {
                std::panic::resume_unwind(join_error.into_panic())
            }
            Err(join_error) => Err(LockError::BackendUnavailable {
                operation: LockOperation::ReleaseLock,
                detail: join_error.to_string(),
            }),
        }
    }
}

impl<B> Drop for HeldLock<B>
where
    B: LockBackend + 'static,
    B::Handle: 'static,
{
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(key = %self.key, "[locked.abandoned] caller went away, releasing in background");
                let backend = Arc::clone(&self.backend);
                let key = self.key.clone();
                runtime.spawn(async move {
                    if let Err(error) = backend.release(handle).await {
                        warn!(
                            key = %key,
                            error = %error,
                            "[locked.release_failed] background release failed"
                        );
                    }
                });
            }
            Err(_) => {
                error!(
                    key = %self.key,
                    "[locked.release_skipped] no runtime to release on, lock left to its lease"
                );
            }
        }
    }
}

/// Combine the critical section's outcome with the release outcome.
fn settle(
    key: LockKey,
    outcome: Result<Result<(), DecreaseError>, Box<dyn Any + Send>>,
    released: Result<(), LockError>,
) -> Result<(), DecreaseError> {
    match (outcome, released) {
        (Err(panic), released) => {
            if let Err(release) = released {
                error!(
                    key = %key,
                    error = %release,
                    "[locked.release_failed] release after panic failed"
                );
            }
            std::panic::resume_unwind(panic)
        }
        (Ok(Ok(())), Ok(())) => Ok(()),
        (Ok(Ok(())), Err(release)) => {
            warn!(
                key = %key,
                error = %release,
                "[locked.release_failed] decrement committed but release failed"
            );
            Ok(())
        }
        (Ok(Err(cause)), Ok(())) => Err(cause),
        (Ok(Err(cause)), Err(release)) => {
            error!(
                key = %key,
                cause = %cause,
                error = %release,
                "[locked.release_failed] decrement and release both failed"
            );
            Err(DecreaseError::ReleaseFailed {
                key,
                cause: Box::new(cause),
                release,
            })
        }
    }
}

type MutexMap = StdMutex<HashMap<ResourceId, Arc<Mutex<()>>>>;

/// Per-resource async mutex held in this process's memory.
///
/// Serialises callers within one process only. Two instances of the service
/// each have their own map and give no exclusion against each other.
/// A resource's mutex is dropped from the map once no caller holds or awaits it.
#[derive(Debug)]
pub struct InProcessMutexFacade<S> {
    store: S,
    locks: MutexMap,
}

impl<S: ResourceStore> InProcessMutexFacade<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn lease(&self, id: ResourceId) -> MutexLease<'_> {
        let mut locks = self.locks.lock().expect("Mutex poisoned");
        MutexLease {
            locks: &self.locks,
            id,
            lock: Arc::clone(locks.entry(id).or_default()),
        }
    }

    /// Number of resources with a live mutex.
    pub fn tracked_resources(&self) -> usize {
        self.locks.lock().expect("Mutex poisoned").len()
    }
}

/// One caller's reference to a resource mutex.
struct MutexLease<'a> {
    locks: &'a MutexMap,
    id: ResourceId,
    lock: Arc<Mutex<()>>,
}

impl Drop for MutexLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().expect("Mutex poisoned");
        // The map and this lease are the only references left.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.id);
        }
    }
}

impl<S: ResourceStore> DecreaseStock for InProcessMutexFacade<S> {
    type Store = S;

    #[instrument(name = "in_process.decrease", skip(self))]
    async fn decrease(&self, id: ResourceId, amount: Quantity) -> Result<(), DecreaseError> {
        let lease = self.lease(id);
        let _guard = lease.lock.lock().await;

        decrement(&self.store, id, amount, ReadMode::Plain).await
    }

    fn store(&self) -> &S {
        &self.store
    }
}

/// Direct read-modify-write with no locking at all.
///
/// Loses updates under concurrency; useful only as a baseline.
#[derive(Debug, Clone)]
pub struct UnguardedFacade<S> {
    store: S,
}

impl<S: ResourceStore> UnguardedFacade<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: ResourceStore> DecreaseStock for UnguardedFacade<S> {
    type Store = S;

    #[instrument(name = "unguarded.decrease", skip(self))]
    async fn decrease(&self, id: ResourceId, amount: Quantity) -> Result<(), DecreaseError> {
        decrement(&self.store, id, amount, ReadMode::Plain).await
    }

    fn store(&self) -> &S {
        &self.store
    }
}
