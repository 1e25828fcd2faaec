use std::sync::{Arc, Mutex};

use nutype::nutype;
use rand::{Rng, SeedableRng, random, rngs::StdRng};
use stocklock::{
    ExpectedVersion, Operation, ReadMode, Resource, ResourceId, ResourceStore, StoreError,
    StoreTransaction,
};
use tracing::warn;

/// Probability value for chaos engineering injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject failures and 1.0 means always inject failures.
///
/// # Examples
///
/// ```ignore
/// use stocklock_testing::chaos::Probability;
///
/// let never = Probability::try_new(0.0).unwrap();
/// let always = Probability::try_new(1.0).unwrap();
///
/// // Values outside [0.0, 1.0] are rejected
/// assert!(Probability::try_new(1.5).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f32);

#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
    version_conflict_probability: Probability,
}

impl ChaosConfig {
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    pub fn with_failure_probability(mut self, probability: f32) -> Self {
        self.failure_probability = Probability::try_new(probability.clamp(0.0, 1.0))
            .expect("clamped value is always valid");
        self
    }

    pub fn with_version_conflict_probability(mut self, probability: f32) -> Self {
        self.version_conflict_probability = Probability::try_new(probability.clamp(0.0, 1.0))
            .expect("clamped value is always valid");
        self
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            failure_probability: Probability::try_new(0.0).expect("0.0 is valid probability"),
            version_conflict_probability: Probability::try_new(0.0)
                .expect("0.0 is valid probability"),
        }
    }
}

/// Shared between a store and every transaction it hands out.
struct Injector {
    config: ChaosConfig,
    rng: Mutex<StdRng>,
}

impl Injector {
    fn should_inject(&self, probability: Probability) -> bool {
        let prob_f32: f32 = probability.into();

        if prob_f32 <= 0.0 {
            return false;
        }

        if prob_f32 >= 1.0 {
            return true;
        }

        let mut rng = self
            .rng
            .lock()
            .expect("chaos RNG mutex should not be poisoned");

        rng.random_bool(f64::from(prob_f32))
    }

    fn should_fail(&self) -> bool {
        self.should_inject(self.config.failure_probability)
    }

    fn should_conflict(&self) -> bool {
        self.should_inject(self.config.version_conflict_probability)
    }
}

pub trait ChaosResourceStoreExt: Sized {
    fn with_chaos(self, config: ChaosConfig) -> ChaosResourceStore<Self>;
}

/// Resource store wrapper that injects store failures and version conflicts.
///
/// Failures can surface from `begin`, `read` and `commit`. Conflicts surface
/// from `commit` of a transaction that wrote, where a real store detects them.
pub struct ChaosResourceStore<S> {
    store: S,
    injector: Arc<Injector>,
}

impl<S> ChaosResourceStore<S> {
    pub fn new(store: S, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            store,
            injector: Arc::new(Injector {
                config,
                rng: Mutex::new(rng),
            }),
        }
    }

    /// The wrapped store, for seeding and inspection without injection.
    pub fn inner(&self) -> &S {
        &self.store
    }
}

impl<S: ResourceStore> ResourceStore for ChaosResourceStore<S> {
    type Transaction = ChaosTransaction<S::Transaction>;

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        if self.injector.should_fail() {
            return Err(injected_failure(Operation::BeginTransaction));
        }

        let inner = self.store.begin().await?;
        Ok(ChaosTransaction {
            inner,
            injector: Arc::clone(&self.injector),
            written: None,
        })
    }

    async fn fetch(&self, id: ResourceId) -> Result<Option<Resource>, StoreError> {
        self.store.fetch(id).await
    }

    async fn insert(&self, resource: Resource) -> Result<(), StoreError> {
        self.store.insert(resource).await
    }
}

/// Transaction handed out by [`ChaosResourceStore`].
pub struct ChaosTransaction<T> {
    inner: T,
    injector: Arc<Injector>,
    written: Option<ResourceId>,
}

impl<T: StoreTransaction> StoreTransaction for ChaosTransaction<T> {
    async fn read(
        &mut self,
        id: ResourceId,
        mode: ReadMode,
    ) -> Result<Option<Resource>, StoreError> {
        if self.injector.should_fail() {
            return Err(injected_failure(Operation::ReadResource));
        }

        self.inner.read(id, mode).await
    }

    async fn write(
        &mut self,
        resource: &Resource,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        self.inner.write(resource, expected).await?;
        self.written = Some(resource.id());
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        let should_conflict = self.injector.should_conflict();
        let should_fail = self.injector.should_fail();

        // Dropping the inner transaction discards its writes.
        if let (true, Some(resource_id)) = (should_conflict, self.written) {
            warn!(
                resource_id = %resource_id,
                "[chaos.injected_conflict] commit rejected with a version conflict"
            );
            return Err(StoreError::VersionConflict { resource_id });
        }

        if should_fail {
            return Err(injected_failure(Operation::CommitTransaction));
        }

        self.inner.commit().await
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}

fn injected_failure(operation: Operation) -> StoreError {
    warn!(operation = %operation, "[chaos.injected_failure] store operation failed");
    StoreError::StoreFailure { operation }
}

impl<S> ChaosResourceStoreExt for S
where
    S: ResourceStore,
{
    fn with_chaos(self, config: ChaosConfig) -> ChaosResourceStore<Self> {
        ChaosResourceStore::new(self, config)
    }
}
