mod common;

use std::time::Duration;

use stocklock::{
    ExpectedVersion, ProductId, Quantity, ReadMode, Resource, ResourceId, ResourceStore,
    StoreError, StoreTransaction, Version,
};
use stocklock_postgres::PostgresResourceStore;

use common::make_store;

fn unique_id() -> ResourceId {
    ResourceId::try_new(rand::random_range(1..i64::MAX)).expect("valid resource id")
}

async fn seeded(store: &PostgresResourceStore, quantity: u64) -> Resource {
    let resource = Resource::new(
        unique_id(),
        ProductId::try_new(1).expect("valid product id"),
        Quantity::new(quantity),
    );
    store.insert(resource.clone()).await.expect("seed");
    resource
}

#[tokio::test(flavor = "multi_thread")]
async fn committed_write_increments_the_version() {
    // Given: a freshly seeded row
    let store = make_store();
    let resource = seeded(&store, 10).await;

    // When: a unit of work decreases it and commits
    let mut tx = store.begin().await.expect("begin");
    let read = tx
        .read(resource.id(), ReadMode::Versioned)
        .await
        .expect("read")
        .expect("exists");
    let updated = read.decrease(Quantity::new(4)).expect("enough");
    tx.write(&updated, ExpectedVersion::Exact(read.version()))
        .await
        .expect("write");
    tx.commit().await.expect("commit");

    // Then: both quantity and version moved
    let stored = store.fetch(resource.id()).await.expect("fetch").expect("exists");
    assert_eq!(stored.quantity(), Quantity::new(6));
    assert_eq!(stored.version(), Version::new(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_versioned_write_is_a_version_conflict() {
    // Given: two units of work that read the same version
    let store = make_store();
    let resource = seeded(&store, 10).await;
    let mut first = store.begin().await.expect("begin");
    let mut second = store.begin().await.expect("begin");
    let a = first
        .read(resource.id(), ReadMode::Versioned)
        .await
        .expect("read")
        .expect("exists");
    let b = second
        .read(resource.id(), ReadMode::Versioned)
        .await
        .expect("read")
        .expect("exists");

    // When: the first commits, then the second writes against the old version
    first
        .write(
            &a.decrease(Quantity::new(1)).expect("enough"),
            ExpectedVersion::Exact(a.version()),
        )
        .await
        .expect("write");
    first.commit().await.expect("commit");
    let result = second
        .write(
            &b.decrease(Quantity::new(1)).expect("enough"),
            ExpectedVersion::Exact(b.version()),
        )
        .await;

    // Then: the second write is rejected and nothing is lost
    assert_eq!(
        result,
        Err(StoreError::VersionConflict {
            resource_id: resource.id(),
        })
    );
    second.rollback().await.expect("rollback");
    let stored = store.fetch(resource.id()).await.expect("fetch").expect("exists");
    assert_eq!(stored.quantity(), Quantity::new(9));
}

#[tokio::test(flavor = "multi_thread")]
async fn exclusive_read_waits_for_the_row_lock_holder() {
    // Given: a unit of work holding the row lock
    let store = make_store();
    let resource = seeded(&store, 10).await;
    let mut holder = store.begin().await.expect("begin");
    holder
        .read(resource.id(), ReadMode::Exclusive)
        .await
        .expect("read");

    // When: another unit of work asks for the same row exclusively
    let mut waiter = store.begin().await.expect("begin");
    let blocked = tokio::time::timeout(
        Duration::from_millis(200),
        waiter.read(resource.id(), ReadMode::Exclusive),
    )
    .await;

    // Then: it is held back until the holder's transaction ends
    assert!(blocked.is_err(), "exclusive read should wait for the holder");
    holder.rollback().await.expect("rollback");
    drop(waiter);

    let mut next = store.begin().await.expect("begin");
    let granted = tokio::time::timeout(
        Duration::from_secs(5),
        next.read(resource.id(), ReadMode::Exclusive),
    )
    .await;
    assert!(matches!(granted, Ok(Ok(Some(_)))));
    next.rollback().await.expect("rollback");
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_row_reads_as_absent() {
    let store = make_store();

    let fetched = store.fetch(unique_id()).await;

    assert_eq!(fetched, Ok(None));
}

#[tokio::test(flavor = "multi_thread")]
async fn migrations_are_idempotent() {
    let store = make_store();

    store.ping().await.expect("ping");
    store.migrate().await.expect("second migration run is a no-op");
}
