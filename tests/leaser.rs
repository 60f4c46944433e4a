//! Integration tests through the public API against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use worklease::{
    BackoffPolicy, Config, InMemoryLeaseStore, Lease, LeaseCoordinator, LeaseError, Leaser,
};

fn config(worker_id: &str) -> Config {
    Config {
        worker_id: worker_id.to_string(),
        lease_table: "units".to_string(),
        expiry: Duration::from_secs(30),
        renew_period: Duration::from_secs(10),
        take_period: Duration::from_secs(10),
        backoff: BackoffPolicy {
            initial: Duration::from_millis(1),
            cap: Duration::from_millis(10),
            factor: 2.0,
        },
        ..Config::default()
    }
}

#[test]
fn extras_are_set_and_read_back_on_the_lease() {
    let mut lease = Lease::new("job-1");
    assert_eq!(lease.get("shard"), None);
    lease.set("shard", "0001");
    lease.set("attempts", 3);
    assert_eq!(lease.get("shard"), Some(&"0001".into()));
    assert_eq!(lease.get("attempts"), Some(&3.into()));
}

#[test]
fn invalid_configs_are_refused_up_front() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let bad = Config {
        renew_period: Duration::from_secs(60),
        ..config("w1")
    };
    assert!(matches!(
        LeaseCoordinator::new(store, bad),
        Err(LeaseError::InvalidConfig(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn created_leases_are_claimed_on_the_next_take_pass() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let coordinator = LeaseCoordinator::new(store, config("w1")).unwrap();
    coordinator.start().await.unwrap();

    for key in ["a", "b", "c"] {
        coordinator.create(Lease::new(key)).await.unwrap();
    }

    // The creations landed after the first take pass; the next one is due
    // one take period later.
    tokio::time::sleep(Duration::from_secs(11)).await;
    let mut held = coordinator.get_leases().await;
    held.sort_by(|a, b| a.key().cmp(b.key()));
    assert_eq!(held.len(), 3);
    assert_eq!(held[0].key(), "a");
    assert!(held.iter().all(|lease| lease.owner() == Some("w1")));
    assert!(held.iter().all(|lease| lease.concurrency_token().is_some()));

    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn create_of_an_existing_key_returns_success_and_changes_nothing() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let coordinator = LeaseCoordinator::new(store, config("w1")).unwrap();
    coordinator.start().await.unwrap();

    coordinator.create(Lease::new("a")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;
    let before = coordinator.get_leases().await.pop().unwrap();
    assert_eq!(before.owner(), Some("w1"));

    // The repeat create succeeds as a no-op, and what it returns is the
    // live record, not the fresh unowned lease the caller passed in.
    let existing = coordinator.create(Lease::new("a")).await.unwrap();
    assert_eq!(existing.owner(), before.owner());
    assert_eq!(existing.counter(), before.counter());

    let after = coordinator.get_leases().await.pop().unwrap();
    assert_eq!(after.owner(), before.owner());
    assert!(after.counter() >= before.counter());

    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn empty_keys_are_rejected() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let coordinator = LeaseCoordinator::new(store, config("w1")).unwrap();
    assert!(matches!(
        coordinator.create(Lease::new("")).await,
        Err(LeaseError::EmptyKey)
    ));
    assert!(matches!(
        coordinator.update(Lease::new("")).await,
        Err(LeaseError::EmptyKey)
    ));
    assert!(matches!(
        coordinator.delete(Lease::new("")).await,
        Err(LeaseError::EmptyKey)
    ));
}

#[tokio::test(start_paused = true)]
async fn update_round_trips_extras_while_the_lease_is_held() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let coordinator = LeaseCoordinator::new(store, config("w1")).unwrap();
    coordinator.start().await.unwrap();

    coordinator.create(Lease::new("a")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;

    let mut held = coordinator.get_leases().await.pop().unwrap();
    held.set("checkpoint", "0042");
    let updated = coordinator.update(held).await.unwrap();
    assert_eq!(updated.get("checkpoint"), Some(&"0042".into()));

    // The attribute is visible to the whole fleet through the store.
    let listed = coordinator
        .manager()
        .list_leases()
        .await
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(listed.get("checkpoint"), Some(&"0042".into()));

    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn update_without_a_token_is_rejected() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let coordinator = LeaseCoordinator::new(store, config("w1")).unwrap();
    coordinator.start().await.unwrap();

    coordinator.create(Lease::new("a")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(coordinator.get_leases().await.len(), 1);

    // A lease value built by hand never carries an acquisition token.
    let err = coordinator.update(Lease::new("a")).await.unwrap_err();
    assert!(matches!(err, LeaseError::TokenNotMatch));

    coordinator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn delete_of_an_absent_key_succeeds() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let coordinator = LeaseCoordinator::new(store, config("w1")).unwrap();
    coordinator.delete(Lease::new("ghost")).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_leaves_held_leases_to_lapse_for_the_fleet() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let w1 = LeaseCoordinator::new(store.clone(), config("w1")).unwrap();
    w1.start().await.unwrap();
    w1.create(Lease::new("a")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(w1.get_leases().await.len(), 1);
    w1.stop().await;

    // The record keeps its owner; only the passage of the expiry window
    // frees it for another worker.
    let w2 = LeaseCoordinator::new(store, config("w2")).unwrap();
    w2.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(w2.get_leases().await.is_empty());

    tokio::time::sleep(Duration::from_secs(40)).await;
    let held = w2.get_leases().await;
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].owner(), Some("w2"));
    w2.stop().await;
}

#[tokio::test(start_paused = true)]
async fn restart_after_stop_is_supported() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let coordinator = LeaseCoordinator::new(store, config("w1")).unwrap();
    coordinator.start().await.unwrap();
    coordinator.stop().await;
    coordinator.start().await.unwrap();
    coordinator.create(Lease::new("a")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(coordinator.get_leases().await.len(), 1);
    coordinator.stop().await;
}
