use crate::lock::{LockError, LockKey, LockOperation};
use crate::resource::{Quantity, ResourceId};
use crate::store::{Operation, StoreError};
use std::time::Duration;

/// Errors surfaced by every decrement strategy.
///
/// Each variant maps to a distinct failure a caller can act on: the resource
/// is missing, the stock is short, the lock could not be obtained, or a
/// collaborator failed. Store conflicts and lock errors are translated into
/// these variants via `From` so strategies can use `?` throughout.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecreaseError {
    /// No resource with the given identifier exists.
    #[error("resource {resource_id} not found")]
    NotFound { resource_id: ResourceId },

    /// The requested amount exceeds the available quantity.
    ///
    /// The persisted quantity is left unchanged.
    #[error(
        "insufficient quantity for resource {resource_id}: requested {requested}, available {available}"
    )]
    InsufficientQuantity {
        resource_id: ResourceId,
        requested: Quantity,
        available: Quantity,
    },

    /// The optimistic strategy exhausted its retries against concurrent writers.
    #[error("resource {resource_id} kept changing concurrently after {attempts} attempts")]
    OptimisticConflict {
        resource_id: ResourceId,
        attempts: u32,
    },

    /// The lock was not obtained within the configured wait.
    #[error("timed out after {waited:?} waiting for lock {key}")]
    LockAcquisitionTimeout { key: LockKey, waited: Duration },

    /// The lock service could not be reached or returned a protocol error.
    #[error("lock service {operation} failed: {detail}")]
    LockBackendUnavailable {
        operation: LockOperation,
        detail: String,
    },

    /// The resource store could not be reached or failed mid-operation.
    #[error("resource store {operation} failed")]
    StoreUnavailable { operation: Operation },

    /// A persisted row could not be interpreted.
    #[error("resource {resource_id} has a corrupt record: {detail}")]
    CorruptRecord {
        resource_id: ResourceId,
        detail: String,
    },

    /// The critical section failed and the lock could not be released either.
    ///
    /// Both failures are reported so neither is lost.
    #[error("{cause}; additionally releasing lock {key} failed: {release}")]
    ReleaseFailed {
        key: LockKey,
        cause: Box<DecreaseError>,
        release: LockError,
    },
}

impl DecreaseError {
    /// True when the failure is transient and the same call may succeed later.
    ///
    /// Insufficient quantity and missing resources are business outcomes and
    /// are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            DecreaseError::OptimisticConflict { .. }
            | DecreaseError::LockAcquisitionTimeout { .. }
            | DecreaseError::LockBackendUnavailable { .. }
            | DecreaseError::StoreUnavailable { .. } => true,
            DecreaseError::NotFound { .. }
            | DecreaseError::InsufficientQuantity { .. }
            | DecreaseError::CorruptRecord { .. } => false,
            DecreaseError::ReleaseFailed { cause, .. } => cause.is_retryable(),
        }
    }
}

impl From<StoreError> for DecreaseError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::VersionConflict { resource_id } => DecreaseError::OptimisticConflict {
                resource_id,
                attempts: 1,
            },
            StoreError::NotFound { resource_id } => DecreaseError::NotFound { resource_id },
            StoreError::CorruptRecord {
                resource_id,
                detail,
            } => DecreaseError::CorruptRecord {
                resource_id,
                detail,
            },
            StoreError::StoreFailure { operation } => DecreaseError::StoreUnavailable { operation },
        }
    }
}

impl From<LockError> for DecreaseError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::AcquisitionTimeout { key, waited } => {
                DecreaseError::LockAcquisitionTimeout { key, waited }
            }
            LockError::NotHeld { key } => DecreaseError::LockBackendUnavailable {
                operation: LockOperation::ReleaseLock,
                detail: format!("lock {key} is not held by this owner"),
            },
            LockError::BackendUnavailable { operation, detail } => {
                DecreaseError::LockBackendUnavailable { operation, detail }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource_id() -> ResourceId {
        ResourceId::try_new(5).expect("valid resource id")
    }

    #[test]
    fn version_conflict_becomes_single_attempt_optimistic_conflict() {
        let error = DecreaseError::from(StoreError::VersionConflict {
            resource_id: resource_id(),
        });

        assert_eq!(
            error,
            DecreaseError::OptimisticConflict {
                resource_id: resource_id(),
                attempts: 1,
            }
        );
    }

    #[test]
    fn store_failure_is_reported_as_store_unavailable() {
        let error = DecreaseError::from(StoreError::StoreFailure {
            operation: Operation::BeginTransaction,
        });

        assert_eq!(
            error,
            DecreaseError::StoreUnavailable {
                operation: Operation::BeginTransaction,
            }
        );
    }

    #[test]
    fn lock_timeout_keeps_key_and_wait() {
        let key = LockKey::try_new("stock:5").expect("valid key");

        let error = DecreaseError::from(LockError::AcquisitionTimeout {
            key: key.clone(),
            waited: Duration::from_secs(5),
        });

        assert_eq!(
            error,
            DecreaseError::LockAcquisitionTimeout {
                key,
                waited: Duration::from_secs(5),
            }
        );
    }

    #[test]
    fn business_outcomes_are_not_retryable() {
        let short = DecreaseError::InsufficientQuantity {
            resource_id: resource_id(),
            requested: Quantity::new(2),
            available: Quantity::new(1),
        };
        let missing = DecreaseError::NotFound {
            resource_id: resource_id(),
        };

        assert!(!short.is_retryable());
        assert!(!missing.is_retryable());
    }

    #[test]
    fn release_failure_inherits_retryability_from_its_cause() {
        let key = LockKey::try_new("stock:5").expect("valid key");
        let error = DecreaseError::ReleaseFailed {
            key: key.clone(),
            cause: Box::new(DecreaseError::StoreUnavailable {
                operation: Operation::CommitTransaction,
            }),
            release: LockError::NotHeld { key },
        };

        assert!(error.is_retryable());
    }

    #[test]
    fn release_failure_message_mentions_both_failures() {
        let key = LockKey::try_new("stock:5").expect("valid key");
        let error = DecreaseError::ReleaseFailed {
            key: key.clone(),
            cause: Box::new(DecreaseError::NotFound {
                resource_id: resource_id(),
            }),
            release: LockError::NotHeld { key },
        };

        let message = error.to_string();

        assert!(message.contains("resource 5 not found"));
        assert!(message.contains("not held"));
    }
}
