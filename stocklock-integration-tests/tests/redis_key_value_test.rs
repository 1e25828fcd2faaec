mod common;

use std::time::Duration;

use stocklock::{
    KeyValueService, LockBackend, LockError, LockKey, ReleaseSubscription, SpinLockBackend,
    SpinLockConfig,
};

use common::make_key_value;
use tracing_test::traced_test;

fn unique_key(prefix: &str) -> String {
    let suffix: u64 = rand::random();
    format!("{prefix}:{suffix}")
}

#[tokio::test(flavor = "multi_thread")]
async fn set_if_absent_grants_the_key_once() {
    let kv = make_key_value();
    let key = unique_key("kv-set");

    let first = kv.set_if_absent(&key, "owner-a", Duration::from_secs(5)).await;
    let second = kv.set_if_absent(&key, "owner-b", Duration::from_secs(5)).await;

    assert_eq!(first, Ok(true));
    assert_eq!(second, Ok(false));
    assert_eq!(kv.delete(&key).await, Ok(true));
}

#[tokio::test(flavor = "multi_thread")]
async fn compare_and_delete_only_removes_the_owners_entry() {
    // Given: a key held by owner-a
    let kv = make_key_value();
    let key = unique_key("kv-cad");
    kv.set_if_absent(&key, "owner-a", Duration::from_secs(5))
        .await
        .expect("set");

    // When: owner-b and then owner-a try to delete it
    let by_other = kv.delete_if_equals(&key, "owner-b").await;
    let by_owner = kv.delete_if_equals(&key, "owner-a").await;

    // Then: only the owner's delete takes effect
    assert_eq!(by_other, Ok(false));
    assert_eq!(by_owner, Ok(true));
    assert_eq!(kv.time_to_live(&key).await, Ok(None));
}

#[tokio::test(flavor = "multi_thread")]
async fn time_to_live_reports_the_remaining_lease() {
    let kv = make_key_value();
    let key = unique_key("kv-ttl");
    kv.set_if_absent(&key, "owner", Duration::from_secs(5))
        .await
        .expect("set");

    let ttl = kv
        .time_to_live(&key)
        .await
        .expect("pttl")
        .expect("key exists");

    assert!(ttl > Duration::ZERO && ttl <= Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread")]
async fn entries_expire_after_their_lease() {
    let kv = make_key_value();
    let key = unique_key("kv-expiry");
    kv.set_if_absent(&key, "owner", Duration::from_millis(100))
        .await
        .expect("set");

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        kv.set_if_absent(&key, "next", Duration::from_secs(5)).await,
        Ok(true)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn subscriber_receives_release_notifications() {
    // Given: a subscription to a release channel
    let kv = make_key_value();
    let channel = unique_key("kv-channel");
    let mut subscription = kv.subscribe(&channel).await.expect("subscribe");

    // When: a release is published
    kv.publish(&channel, "owner-a").await.expect("publish");

    // Then: the subscriber sees it promptly
    let message = tokio::time::timeout(Duration::from_secs(5), subscription.next_message()).await;
    assert_eq!(message, Ok(Ok(Some("owner-a".to_string()))));
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn releasing_after_the_lease_lapsed_leaves_the_new_owner_alone() {
    // Given: a spin lock whose short lease lapsed and was taken over
    let backend = SpinLockBackend::with_config(
        make_key_value(),
        SpinLockConfig::default().with_lease(Duration::from_millis(100)),
    );
    let key = LockKey::try_new(unique_key("kv-stale-release")).expect("valid lock key");
    let stale = backend.acquire(&key).await.expect("acquire");
    tokio::time::sleep(Duration::from_millis(250)).await;
    let current = backend.acquire(&key).await.expect("acquire after lapse");

    // When: the first holder releases late
    let result = backend.release(stale).await;

    // Then: it is told the lock was not held and the new entry survives
    assert_eq!(result, Err(LockError::NotHeld { key: key.clone() }));
    assert!(logs_contain("[spin_lock.not_held]"));
    backend.release(current).await.expect("release");
}
