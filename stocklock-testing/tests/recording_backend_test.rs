use std::sync::Arc;
use std::time::Duration;

use stocklock::{
    DecreaseError, DecreaseStock, LockedFacade, ProductId, Quantity, Resource, ResourceId,
    ResourceStore, SpinLockBackend, SpinLockConfig,
};
use stocklock_memory::{InMemoryKeyValue, InMemoryResourceStore};
use stocklock_testing::RecordingLockBackend;

#[tokio::test(flavor = "multi_thread")]
async fn facade_holds_the_lock_around_every_critical_section() {
    // Given: a spin-lock facade whose backend records every hold
    let backend = RecordingLockBackend::new(SpinLockBackend::with_config(
        InMemoryKeyValue::new(),
        SpinLockConfig::default().with_retry_interval(Duration::from_millis(1)),
    ));
    let store = InMemoryResourceStore::new();
    let id = ResourceId::try_new(7).expect("valid resource id");
    store
        .insert(Resource::new(
            id,
            ProductId::try_new(1).expect("valid product id"),
            Quantity::new(30),
        ))
        .await
        .expect("seed");
    let facade = Arc::new(LockedFacade::new(backend, store));

    // When: more callers than units race for the same resource
    let tasks: Vec<_> = (0..40)
        .map(|_| {
            let facade = Arc::clone(&facade);
            tokio::spawn(async move { facade.decrease(id, Quantity::new(1)).await })
        })
        .collect();
    let mut rejected = 0;
    for task in tasks {
        match task.await.expect("task") {
            Ok(()) => {}
            Err(DecreaseError::InsufficientQuantity { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    // Then: holds never overlapped and failed calls released their lock too
    assert_eq!(rejected, 10);
    assert_eq!(facade.backend().intervals().len(), 40);
    assert_eq!(facade.backend().find_overlap(), None);
}
