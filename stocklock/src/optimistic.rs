use stocklock_types::{DecreaseError, Quantity, ReadMode, ResourceId, ResourceStore};
use tracing::instrument;

use crate::decrement::decrement;
use crate::facade::DecreaseStock;
use crate::retry::{RetryPolicy, retry_on_conflict};

/// Optimistic strategy: no lock, version-conditioned write, retry on conflict.
///
/// Each attempt runs the whole read-modify-write cycle in a fresh unit of
/// work. Contention shows up as retries rather than waiting; the
/// [`RetryPolicy`] decides how many and how far apart.
#[derive(Debug, Clone)]
pub struct OptimisticLockFacade<S> {
    store: S,
    policy: RetryPolicy,
}

impl<S: ResourceStore> OptimisticLockFacade<S> {
    /// Create a facade with the default bounded [`RetryPolicy`].
    pub fn new(store: S) -> Self {
        Self::with_policy(store, RetryPolicy::default())
    }

    pub fn with_policy(store: S, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl<S: ResourceStore> DecreaseStock for OptimisticLockFacade<S> {
    type Store = S;

    #[instrument(name = "optimistic.decrease", skip(self))]
    async fn decrease(&self, id: ResourceId, amount: Quantity) -> Result<(), DecreaseError> {
        retry_on_conflict(&self.policy, id, || {
            decrement(&self.store, id, amount, ReadMode::Versioned)
        })
        .await
    }

    fn store(&self) -> &S {
        &self.store
    }
}
