use crate::resource::ResourceId;
use crate::validation::no_whitespace_or_control;
use chrono::{DateTime, Utc};
use nutype::nutype;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

/// Name of a lock.
///
/// LockKey identifies what a lock protects. Keys are derived from a resource
/// id, so two callers decrementing different resources never contend.
/// Uses nutype for validation ensuring all keys are:
/// - Non-empty (trimmed strings with at least 1 character)
/// - Within reasonable length (max 255 characters)
/// - Free of whitespace and control characters
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255, predicate = no_whitespace_or_control),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct LockKey(String);

/// Namespace prepended to resource ids when deriving lock keys.
///
/// Limited to 200 characters so a derived key (prefix, separator and a
/// 64-bit id) always fits in a [`LockKey`].
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 200, predicate = no_whitespace_or_control),
    derive(Debug, Clone, PartialEq, Eq, Hash, AsRef, Display)
)]
pub struct LockKeyPrefix(String);

impl LockKeyPrefix {
    /// The default `stock` namespace.
    pub fn stock() -> Self {
        Self::try_new("stock").expect("'stock' is a valid lock key prefix")
    }
}

impl Default for LockKeyPrefix {
    fn default() -> Self {
        Self::stock()
    }
}

impl LockKey {
    /// Derive the lock key protecting `resource_id`, e.g. `stock:42`.
    pub fn for_resource(prefix: &LockKeyPrefix, resource_id: ResourceId) -> Self {
        Self::try_new(format!("{}:{}", prefix, resource_id))
            .expect("prefix is bounded and validated, resource ids are digits")
    }
}

/// Per-acquisition owner identity.
///
/// Stored as the value of a distributed lock entry so that release can be
/// fenced: only the owner that wrote the entry may delete it.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRef))]
pub struct OwnerToken(Uuid);

impl OwnerToken {
    /// Generate a fresh, time-ordered owner token.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// A held lock instance.
///
/// Created on successful acquire and consumed by release. It is owned by the
/// caller that acquired it and is never shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    key: LockKey,
    owner: OwnerToken,
    lease_expires_at: Option<DateTime<Utc>>,
}

impl LockHandle {
    /// Handle for a lock without a lease (held until explicitly released).
    pub fn unleased(key: LockKey, owner: OwnerToken) -> Self {
        Self {
            key,
            owner,
            lease_expires_at: None,
        }
    }

    /// Handle for a lock that the service reclaims once `lease` elapses.
    pub fn leased(key: LockKey, owner: OwnerToken, lease: Duration) -> Self {
        let lease_expires_at = chrono::TimeDelta::from_std(lease)
            .ok()
            .and_then(|lease| Utc::now().checked_add_signed(lease));

        Self {
            key,
            owner,
            lease_expires_at,
        }
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn owner(&self) -> OwnerToken {
        self.owner
    }

    /// Absolute time after which the lock is considered abandoned.
    pub fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
        self.lease_expires_at
    }

    /// True once the lease has run out. Unleased locks never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at
            .is_some_and(|expires_at| expires_at <= now)
    }
}

impl AsRef<LockHandle> for LockHandle {
    fn as_ref(&self) -> &LockHandle {
        self
    }
}

/// Identifies the lock service operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOperation {
    /// Connecting to the lock service.
    Connect,
    /// Opening a dedicated advisory-lock session.
    OpenSession,
    /// Requesting a lock.
    AcquireLock,
    /// Releasing a lock.
    ReleaseLock,
    /// Atomic set-if-absent with time-to-live.
    SetIfAbsent,
    /// Unconditional delete of a lock entry.
    Delete,
    /// Owner-fenced delete of a lock entry.
    CompareAndDelete,
    /// Reading the remaining time-to-live of a lock entry.
    TimeToLive,
    /// Publishing a release notification.
    Publish,
    /// Subscribing to release notifications.
    Subscribe,
    /// Waiting for a release notification.
    ReceiveNotification,
}

impl std::fmt::Display for LockOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockOperation::Connect => write!(f, "connect"),
            LockOperation::OpenSession => write!(f, "open_session"),
            LockOperation::AcquireLock => write!(f, "acquire_lock"),
            LockOperation::ReleaseLock => write!(f, "release_lock"),
            LockOperation::SetIfAbsent => write!(f, "set_if_absent"),
            LockOperation::Delete => write!(f, "delete"),
            LockOperation::CompareAndDelete => write!(f, "compare_and_delete"),
            LockOperation::TimeToLive => write!(f, "time_to_live"),
            LockOperation::Publish => write!(f, "publish"),
            LockOperation::Subscribe => write!(f, "subscribe"),
            LockOperation::ReceiveNotification => write!(f, "receive_notification"),
        }
    }
}

/// Error type returned by lock backends and the services behind them.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The lock could not be obtained within the configured wait.
    #[error("timed out after {waited:?} waiting for lock {key}")]
    AcquisitionTimeout { key: LockKey, waited: Duration },

    /// Release was attempted for a lock the caller no longer holds, typically
    /// because its lease expired and another caller acquired the key.
    #[error("lock {key} is not held by this owner")]
    NotHeld { key: LockKey },

    /// Connectivity or protocol failure talking to the lock service.
    #[error("{operation} operation failed: {detail}")]
    BackendUnavailable {
        operation: LockOperation,
        detail: String,
    },
}

/// Acquire/release contract implemented by every explicit lock strategy.
///
/// The row-lock strategy has no backend: its acquisition is the exclusive read
/// itself and its release is the end of the transaction.
pub trait LockBackend: Send + Sync {
    /// Proof of ownership returned by a successful acquisition.
    type Handle: AsRef<LockHandle> + Send;

    /// Acquire the lock, waiting according to the backend's policy.
    fn acquire(
        &self,
        key: &LockKey,
    ) -> impl Future<Output = Result<Self::Handle, LockError>> + Send;

    /// Make a single attempt. `Ok(None)` when another caller holds the lock.
    fn try_acquire(
        &self,
        key: &LockKey,
    ) -> impl Future<Output = Result<Option<Self::Handle>, LockError>> + Send;

    /// Release a held lock.
    fn release(&self, handle: Self::Handle) -> impl Future<Output = Result<(), LockError>> + Send;
}
