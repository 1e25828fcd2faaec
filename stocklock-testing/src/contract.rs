use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use stocklock::{
    DecreaseError, DecreaseStock, LockBackend, LockError, LockHandle, LockKey, ProductId,
    Quantity, Resource, ResourceId, ResourceStore, StoreError,
};

use crate::recording::RecordingLockBackend;

#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(scenario: &'static str, operation: &'static str, error: StoreError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn decrease_error(scenario: &'static str, error: DecreaseError) -> Self {
        Self::new(
            scenario,
            format!("decrease operation returned unexpected error: {error}"),
        )
    }

    fn lock_error(scenario: &'static str, operation: &'static str, error: LockError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

pub type ContractTestResult = Result<(), ContractTestFailure>;

/// Random id so scenarios sharing one database never touch each other's rows.
fn contract_resource_id(scenario: &'static str) -> Result<ResourceId, ContractTestFailure> {
    ResourceId::try_new(rand::random_range(1..i64::MAX)).map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("invalid contract resource id: {error}"))
    })
}

fn contract_lock_key(scenario: &'static str) -> Result<LockKey, ContractTestFailure> {
    let suffix: u64 = rand::random();
    LockKey::try_new(format!("contract-{scenario}:{suffix}")).map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("invalid contract lock key: {error}"))
    })
}

fn contract_product_id(scenario: &'static str) -> Result<ProductId, ContractTestFailure> {
    ProductId::try_new(1).map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("invalid contract product id: {error}"))
    })
}

async fn seed<S: ResourceStore>(
    scenario: &'static str,
    store: &S,
    id: ResourceId,
    quantity: u64,
) -> ContractTestResult {
    let resource = Resource::new(id, contract_product_id(scenario)?, Quantity::new(quantity));
    store
        .insert(resource)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "insert", error))
}

async fn stored_quantity<S: ResourceStore>(
    scenario: &'static str,
    store: &S,
    id: ResourceId,
) -> Result<Quantity, ContractTestFailure> {
    store
        .fetch(id)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "fetch", error))?
        .map(|resource| resource.quantity())
        .ok_or_else(|| {
            ContractTestFailure::assertion(scenario, format!("seeded resource {id} disappeared"))
        })
}

async fn expect_quantity<S: ResourceStore>(
    scenario: &'static str,
    store: &S,
    id: ResourceId,
    expected: u64,
) -> ContractTestResult {
    let actual = stored_quantity(scenario, store, id).await?;
    if actual != Quantity::new(expected) {
        return Err(ContractTestFailure::assertion(
            scenario,
            format!("expected quantity {expected} for resource {id} but found {actual}"),
        ));
    }
    Ok(())
}

/// Spawn `callers` concurrent decrements of `amount` and collect every outcome.
async fn decrease_concurrently<D>(
    scenario: &'static str,
    facade: &Arc<D>,
    id: ResourceId,
    callers: usize,
    amount: u64,
) -> Result<Vec<Result<(), DecreaseError>>, ContractTestFailure>
where
    D: DecreaseStock + 'static,
{
    let tasks: Vec<_> = (0..callers)
        .map(|_| {
            let facade = Arc::clone(facade);
            tokio::spawn(async move { facade.decrease(id, Quantity::new(amount)).await })
        })
        .collect();

    let mut outcomes = Vec::with_capacity(callers);
    for task in tasks {
        let outcome = task.await.map_err(|error| {
            ContractTestFailure::assertion(scenario, format!("decrease task failed: {error}"))
        })?;
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

pub async fn test_single_decrease<F, D>(make_facade: F) -> ContractTestResult
where
    F: Fn() -> D + Send + Sync + Clone + 'static,
    D: DecreaseStock + 'static,
{
    const SCENARIO: &str = "single_decrease";

    let facade = make_facade();
    let id = contract_resource_id(SCENARIO)?;
    seed(SCENARIO, facade.store(), id, 10).await?;

    facade
        .decrease(id, Quantity::new(3))
        .await
        .map_err(|error| ContractTestFailure::decrease_error(SCENARIO, error))?;

    expect_quantity(SCENARIO, facade.store(), id, 7).await
}

pub async fn test_insufficient_quantity_guard<F, D>(make_facade: F) -> ContractTestResult
where
    F: Fn() -> D + Send + Sync + Clone + 'static,
    D: DecreaseStock + 'static,
{
    const SCENARIO: &str = "insufficient_quantity_guard";

    let facade = make_facade();
    let id = contract_resource_id(SCENARIO)?;
    seed(SCENARIO, facade.store(), id, 2).await?;

    match facade.decrease(id, Quantity::new(5)).await {
        Err(DecreaseError::InsufficientQuantity {
            resource_id,
            requested,
            available,
        }) => {
            if resource_id != id || requested != Quantity::new(5) || available != Quantity::new(2)
            {
                return Err(ContractTestFailure::assertion(
                    SCENARIO,
                    format!(
                        "insufficient quantity error carried wrong details: resource {resource_id}, requested {requested}, available {available}"
                    ),
                ));
            }
        }
        Err(error) => return Err(ContractTestFailure::decrease_error(SCENARIO, error)),
        Ok(()) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "decrease of 5 succeeded with only 2 available",
            ));
        }
    }

    // A rejected decrease leaves the row unchanged, and exact depletion is fine.
    expect_quantity(SCENARIO, facade.store(), id, 2).await?;
    facade
        .decrease(id, Quantity::new(2))
        .await
        .map_err(|error| ContractTestFailure::decrease_error(SCENARIO, error))?;
    expect_quantity(SCENARIO, facade.store(), id, 0).await
}

pub async fn test_missing_resource<F, D>(make_facade: F) -> ContractTestResult
where
    F: Fn() -> D + Send + Sync + Clone + 'static,
    D: DecreaseStock + 'static,
{
    const SCENARIO: &str = "missing_resource";

    let facade = make_facade();
    let id = contract_resource_id(SCENARIO)?;

    match facade.decrease(id, Quantity::new(1)).await {
        Err(DecreaseError::NotFound { resource_id }) if resource_id == id => {}
        Err(error) => return Err(ContractTestFailure::decrease_error(SCENARIO, error)),
        Ok(()) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "decrease of a resource that was never seeded succeeded",
            ));
        }
    }

    let stored = facade
        .store()
        .fetch(id)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "fetch", error))?;
    if stored.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "failed decrease created the missing resource",
        ));
    }
    Ok(())
}

pub async fn test_concurrent_conservation<F, D>(make_facade: F) -> ContractTestResult
where
    F: Fn() -> D + Send + Sync + Clone + 'static,
    D: DecreaseStock + 'static,
{
    const SCENARIO: &str = "concurrent_conservation";
    const INITIAL: u64 = 100;
    const CALLERS: usize = 100;

    let facade = Arc::new(make_facade());
    let id = contract_resource_id(SCENARIO)?;
    seed(SCENARIO, facade.store(), id, INITIAL).await?;

    // Observer polls committed state while the decrements run.
    let done = Arc::new(AtomicBool::new(false));
    let observer = {
        let facade = Arc::clone(&facade);
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            let mut observed = Vec::new();
            while !done.load(Ordering::Acquire) {
                observed.push(facade.store().fetch(id).await);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            observed
        })
    };

    let outcomes = decrease_concurrently(SCENARIO, &facade, id, CALLERS, 1).await?;
    done.store(true, Ordering::Release);
    let observed = observer.await.map_err(|error| {
        ContractTestFailure::assertion(SCENARIO, format!("observer task failed: {error}"))
    })?;

    for outcome in outcomes {
        outcome.map_err(|error| ContractTestFailure::decrease_error(SCENARIO, error))?;
    }

    let mut previous = Quantity::new(INITIAL);
    for observation in observed {
        let quantity = observation
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "observer fetch", error))?
            .map(|resource| resource.quantity())
            .ok_or_else(|| {
                ContractTestFailure::assertion(SCENARIO, "observer lost sight of the resource")
            })?;
        if quantity > previous {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("observed quantity rose from {previous} to {quantity}"),
            ));
        }
        previous = quantity;
    }

    expect_quantity(SCENARIO, facade.store(), id, 0).await
}

pub async fn test_overdraw_under_contention<F, D>(make_facade: F) -> ContractTestResult
where
    F: Fn() -> D + Send + Sync + Clone + 'static,
    D: DecreaseStock + 'static,
{
    const SCENARIO: &str = "overdraw_under_contention";
    const INITIAL: u64 = 10;
    const CALLERS: usize = 30;

    let facade = Arc::new(make_facade());
    let id = contract_resource_id(SCENARIO)?;
    seed(SCENARIO, facade.store(), id, INITIAL).await?;

    let outcomes = decrease_concurrently(SCENARIO, &facade, id, CALLERS, 1).await?;

    let mut succeeded = 0_u64;
    let mut rejected = 0_usize;
    for outcome in outcomes {
        match outcome {
            Ok(()) => succeeded += 1,
            Err(DecreaseError::InsufficientQuantity { .. }) => rejected += 1,
            Err(error) => return Err(ContractTestFailure::decrease_error(SCENARIO, error)),
        }
    }

    if succeeded != INITIAL || rejected != CALLERS - 10 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "expected {INITIAL} successes and {} rejections but saw {succeeded} and {rejected}",
                CALLERS - 10
            ),
        ));
    }

    expect_quantity(SCENARIO, facade.store(), id, 0).await
}

pub async fn test_resource_isolation<F, D>(make_facade: F) -> ContractTestResult
where
    F: Fn() -> D + Send + Sync + Clone + 'static,
    D: DecreaseStock + 'static,
{
    const SCENARIO: &str = "resource_isolation";

    let facade = Arc::new(make_facade());
    let left = contract_resource_id(SCENARIO)?;
    let right = contract_resource_id(SCENARIO)?;
    seed(SCENARIO, facade.store(), left, 20).await?;
    seed(SCENARIO, facade.store(), right, 20).await?;

    let left_outcomes = decrease_concurrently(SCENARIO, &facade, left, 10, 2).await?;
    let right_outcomes = decrease_concurrently(SCENARIO, &facade, right, 5, 1).await?;

    for outcome in left_outcomes.into_iter().chain(right_outcomes) {
        outcome.map_err(|error| ContractTestFailure::decrease_error(SCENARIO, error))?;
    }

    expect_quantity(SCENARIO, facade.store(), left, 0).await?;
    expect_quantity(SCENARIO, facade.store(), right, 15).await
}

pub async fn test_exclusive_acquisition<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B + Send + Sync + Clone + 'static,
    B: LockBackend + 'static,
{
    const SCENARIO: &str = "exclusive_acquisition";

    let backend = make_backend();
    let key = contract_lock_key(SCENARIO)?;

    let held = backend
        .acquire(&key)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire", error))?;
    if held.as_ref().key() != &key {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("handle names key {} instead of {key}", held.as_ref().key()),
        ));
    }

    let contender = backend
        .try_acquire(&key)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "try_acquire", error))?;
    if contender.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "second acquisition succeeded while the lock was held",
        ));
    }

    backend
        .release(held)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "release", error))?;

    let after_release = backend
        .try_acquire(&key)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "try_acquire", error))?
        .ok_or_else(|| {
            ContractTestFailure::assertion(SCENARIO, "lock stayed held after release")
        })?;
    backend
        .release(after_release)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "release", error))
}

pub async fn test_key_isolation<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B + Send + Sync + Clone + 'static,
    B: LockBackend + 'static,
{
    const SCENARIO: &str = "key_isolation";

    let backend = make_backend();
    let left = contract_lock_key(SCENARIO)?;
    let right = contract_lock_key(SCENARIO)?;

    let left_handle = backend
        .acquire(&left)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire", error))?;
    let right_handle = backend
        .try_acquire(&right)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "try_acquire", error))?
        .ok_or_else(|| {
            ContractTestFailure::assertion(
                SCENARIO,
                format!("holding {left} blocked unrelated key {right}"),
            )
        })?;

    backend
        .release(right_handle)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "release", error))?;
    backend
        .release(left_handle)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "release", error))
}

pub async fn test_mutual_exclusion<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B + Send + Sync + Clone + 'static,
    B: LockBackend + 'static,
{
    const SCENARIO: &str = "mutual_exclusion";
    const CALLERS: usize = 20;

    let backend = Arc::new(RecordingLockBackend::new(make_backend()));
    let key = contract_lock_key(SCENARIO)?;

    let tasks: Vec<_> = (0..CALLERS)
        .map(|_| {
            let backend = Arc::clone(&backend);
            let key = key.clone();
            tokio::spawn(async move {
                let handle = backend.acquire(&key).await?;
                tokio::time::sleep(Duration::from_millis(2)).await;
                backend.release(handle).await
            })
        })
        .collect();

    for task in tasks {
        task.await
            .map_err(|error| {
                ContractTestFailure::assertion(SCENARIO, format!("lock task failed: {error}"))
            })?
            .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire/release", error))?;
    }

    let recorded = backend.intervals().len();
    if recorded != CALLERS {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected {CALLERS} recorded holds but found {recorded}"),
        ));
    }
    if let Some((first, second)) = backend.find_overlap() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("two holders overlapped on {}: {first:?} and {second:?}", first.key),
        ));
    }
    Ok(())
}

/// How long until `handle`'s lease lapses, with a small margin for clock skew.
fn until_expiry(
    scenario: &'static str,
    handle: &LockHandle,
) -> Result<Duration, ContractTestFailure> {
    let expires_at = handle.lease_expires_at().ok_or_else(|| {
        ContractTestFailure::assertion(scenario, "backend granted a lock without a lease")
    })?;
    let remaining = (expires_at - chrono::Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    Ok(remaining + Duration::from_millis(100))
}

pub async fn test_lease_recovery<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B + Send + Sync + Clone + 'static,
    B: LockBackend + 'static,
{
    const SCENARIO: &str = "lease_recovery";

    let backend = make_backend();
    let key = contract_lock_key(SCENARIO)?;

    // A holder that never releases, as if its process died.
    let abandoned = backend
        .acquire(&key)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire", error))?;
    let wait = until_expiry(SCENARIO, abandoned.as_ref())?;

    let recovered = tokio::time::timeout(wait + Duration::from_secs(5), backend.acquire(&key))
        .await
        .map_err(|_| {
            ContractTestFailure::assertion(SCENARIO, "lock was never recovered after its lease")
        })?
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire", error))?;

    if recovered.as_ref().owner() == abandoned.as_ref().owner() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "recovered lock reused the abandoned owner token",
        ));
    }

    backend
        .release(recovered)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "release", error))
}

pub async fn test_fenced_release<F, B>(make_backend: F) -> ContractTestResult
where
    F: Fn() -> B + Send + Sync + Clone + 'static,
    B: LockBackend + 'static,
{
    const SCENARIO: &str = "fenced_release";

    let backend = make_backend();
    let key = contract_lock_key(SCENARIO)?;

    let stale = backend
        .acquire(&key)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "acquire", error))?;
    tokio::time::sleep(until_expiry(SCENARIO, stale.as_ref())?).await;

    let current = backend
        .try_acquire(&key)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "try_acquire", error))?
        .ok_or_else(|| {
            ContractTestFailure::assertion(SCENARIO, "lock still held after its lease expired")
        })?;

    match backend.release(stale).await {
        Err(LockError::NotHeld { .. }) => {}
        Err(error) => return Err(ContractTestFailure::lock_error(SCENARIO, "release", error)),
        Ok(()) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "stale holder's release succeeded after its lease expired",
            ));
        }
    }

    let contender = backend
        .try_acquire(&key)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "try_acquire", error))?;
    if contender.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "stale release removed the current holder's lock",
        ));
    }

    backend
        .release(current)
        .await
        .map_err(|error| ContractTestFailure::lock_error(SCENARIO, "release", error))
}

#[macro_export]
macro_rules! decrease_contract_tests {
    (suite = $suite:ident, make_facade = $make_facade:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_concurrent_conservation, test_insufficient_quantity_guard,
                test_missing_resource, test_overdraw_under_contention, test_resource_isolation,
                test_single_decrease,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn single_decrease_contract() {
                test_single_decrease($make_facade)
                    .await
                    .expect("decrease contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn insufficient_quantity_guard_contract() {
                test_insufficient_quantity_guard($make_facade)
                    .await
                    .expect("decrease contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn missing_resource_contract() {
                test_missing_resource($make_facade)
                    .await
                    .expect("decrease contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn concurrent_conservation_contract() {
                test_concurrent_conservation($make_facade)
                    .await
                    .expect("decrease contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn overdraw_under_contention_contract() {
                test_overdraw_under_contention($make_facade)
                    .await
                    .expect("decrease contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn resource_isolation_contract() {
                test_resource_isolation($make_facade)
                    .await
                    .expect("decrease contract failed");
            }
        }
    };
}

pub use decrease_contract_tests;

#[macro_export]
macro_rules! lock_backend_contract_tests {
    (suite = $suite:ident, make_backend = $make_backend:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_exclusive_acquisition, test_key_isolation, test_mutual_exclusion,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn exclusive_acquisition_contract() {
                test_exclusive_acquisition($make_backend)
                    .await
                    .expect("lock backend contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn key_isolation_contract() {
                test_key_isolation($make_backend)
                    .await
                    .expect("lock backend contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn mutual_exclusion_contract() {
                test_mutual_exclusion($make_backend)
                    .await
                    .expect("lock backend contract failed");
            }
        }
    };
}

pub use lock_backend_contract_tests;

#[macro_export]
macro_rules! leased_lock_contract_tests {
    (suite = $suite:ident, make_backend = $make_backend:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{test_fenced_release, test_lease_recovery};

            #[tokio::test(flavor = "multi_thread")]
            async fn lease_recovery_contract() {
                test_lease_recovery($make_backend)
                    .await
                    .expect("leased lock contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn fenced_release_contract() {
                test_fenced_release($make_backend)
                    .await
                    .expect("leased lock contract failed");
            }
        }
    };
}

pub use leased_lock_contract_tests;
