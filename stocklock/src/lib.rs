//! `StockLock` - safe decrement of a persisted quantity under concurrency
//!
//! This library implements one critical section (read the current quantity,
//! validate it, subtract, persist) and a family of strategies that make it
//! safe when many callers, possibly in many processes, race on the same row:
//!
//! - [`PessimisticLockFacade`]: row-level exclusive read held until commit
//! - [`OptimisticLockFacade`]: version-conditioned write with a [`RetryPolicy`]
//! - [`NamedLockFacade`]: session-scoped advisory lock
//! - [`SpinLockFacade`]: set-if-absent key with a fixed polling interval
//! - [`BlockingLockFacade`]: leased key with release notifications
//!
//! Every facade implements [`DecreaseStock`]. Collaborators (resource store,
//! advisory lock service, key-value service) are traits from
//! `stocklock-types`, implemented by `stocklock-memory`, `stocklock-postgres`
//! and `stocklock-redis`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod decrement;
mod facade;
mod optimistic;
mod retry;

pub use backend::{
    AdvisoryLockBackend, AdvisoryLockConfig, AdvisoryLockHandle, BlockingLockBackend,
    BlockingLockConfig, ReleaseMode, SpinLockBackend, SpinLockConfig, release_channel,
};
pub use decrement::decrement;
pub use facade::{
    BlockingLockFacade, DecreaseStock, InProcessMutexFacade, LockedFacade, NamedLockFacade,
    PessimisticLockFacade, SpinLockFacade, UnguardedFacade,
};
pub use optimistic::OptimisticLockFacade;
pub use retry::{Backoff, MetricsHook, RetryContext, RetryLimit, RetryPolicy, retry_on_conflict};

// Re-export the shared vocabulary so callers depend on one crate.
pub use stocklock_types::{
    AdvisoryLockService, AdvisorySession, DecreaseError, ExpectedVersion, KeyValueService,
    LockBackend, LockError, LockHandle, LockKey, LockKeyError, LockKeyPrefix, LockKeyPrefixError,
    LockOperation, Operation, OwnerToken, ProductId, ProductIdError, Quantity, ReadMode,
    ReleaseSubscription, Resource, ResourceId, ResourceIdError, ResourceStore, StoreError,
    StoreTransaction, Version,
};
