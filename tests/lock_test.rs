//! Row lock behavior through the data service.
//!
//! Lock calls only read the table schema to resolve row keys, so these tests
//! run on tokio's paused clock where TTLs matter.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestFixture, USERS};
use datagate::lock::RowLockManager;
use datagate::service::{Actor, LockRelease};
use datagate::DataError;
use tokio::sync::{watch, Barrier};
use tokio_test::{assert_err, assert_ok};

#[tokio::test(start_paused = true)]
async fn test_second_actor_sees_holder() {
    let fixture = TestFixture::new();
    let service = fixture.service_with_ttl(Duration::from_secs(300));
    let bob = Actor::new("bob");
    let alice = Actor::new("alice");

    service.request_edit_lock(USERS, "1", &bob).await.unwrap();
    tokio::time::advance(Duration::from_secs(100)).await;

    match service.request_edit_lock(USERS, "1", &alice).await {
        Err(DataError::RowLocked { holder, remaining }) => {
            assert_eq!(holder, "bob");
            assert_eq!(remaining, Duration::from_secs(200));
        }
        other => panic!("expected RowLocked, got {other:?}"),
    }

    // Other rows are independent.
    service.request_edit_lock(USERS, "2", &alice).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_expired_lock_is_acquirable() {
    let fixture = TestFixture::new();
    let ttl = Duration::from_secs(10);
    let service = fixture.service_with_ttl(ttl);
    let bob = Actor::new("bob");
    let alice = Actor::new("alice");

    assert_ok!(service.request_edit_lock(USERS, "1", &bob).await);
    assert_err!(service.request_edit_lock(USERS, "1", &alice).await);
    tokio::time::advance(ttl + Duration::from_millis(1)).await;

    let lock = assert_ok!(service.request_edit_lock(USERS, "1", &alice).await);
    assert_eq!(lock.holder, "alice");

    // Bob's stale lock no longer lets him write.
    assert!(matches!(
        service.locks().check_write(USERS, "1", "bob"),
        Err(DataError::WriteDenied(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_refresh_extends_only_for_holder() {
    let fixture = TestFixture::new();
    let ttl = Duration::from_secs(10);
    let service = fixture.service_with_ttl(ttl);
    let bob = Actor::new("bob");
    let alice = Actor::new("alice");

    service.request_edit_lock(USERS, "1", &bob).await.unwrap();
    tokio::time::advance(Duration::from_secs(8)).await;
    service.refresh_edit_lock(USERS, "1", &bob).await.unwrap();

    assert!(matches!(
        service.refresh_edit_lock(USERS, "1", &alice).await,
        Err(DataError::NotLockHolder { holder: Some(h), .. }) if h == "bob"
    ));

    // Past the original expiry, still inside the refreshed one.
    tokio::time::advance(Duration::from_secs(8)).await;
    assert!(service.request_edit_lock(USERS, "1", &alice).await.is_err());

    tokio::time::advance(Duration::from_secs(3)).await;
    assert!(matches!(
        service.refresh_edit_lock(USERS, "1", &bob).await,
        Err(DataError::NotLockHolder { holder: None, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_release_is_idempotent() {
    let fixture = TestFixture::new();
    let service = fixture.service();
    let bob = Actor::new("bob");

    service.request_edit_lock(USERS, "1", &bob).await.unwrap();
    assert_eq!(
        service.release_edit_lock(USERS, "1", &bob).await.unwrap(),
        LockRelease::Released
    );
    for _ in 0..3 {
        assert_eq!(
            service.release_edit_lock(USERS, "1", &bob).await.unwrap(),
            LockRelease::AlreadyReleased
        );
    }
    assert_eq!(
        service.release_edit_lock(USERS, "never-locked", &bob).await.unwrap(),
        LockRelease::AlreadyReleased
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_has_one_winner() {
    const SESSIONS: usize = 64;
    let manager = Arc::new(RowLockManager::new(Duration::from_secs(300)));
    let barrier = Arc::new(Barrier::new(SESSIONS));

    let handles: Vec<_> = (0..SESSIONS)
        .map(|i| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                manager.acquire(USERS, "1", &format!("session-{i}")).is_ok()
            })
        })
        .collect();

    let winners = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|won| *won.as_ref().unwrap())
        .count();
    assert_eq!(winners, 1);
    assert_eq!(manager.active_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_reclaims_expired_slots() {
    let fixture = TestFixture::new();
    let service = fixture.service_with_ttl(Duration::from_secs(5));
    let bob = Actor::new("bob");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = service.spawn_lock_sweeper(Duration::from_secs(10), shutdown_rx);

    for row in ["1", "2", "3"] {
        service.request_edit_lock(USERS, row, &bob).await.unwrap();
    }
    assert_eq!(service.locks().slot_count(), 3);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(service.locks().slot_count(), 0);

    shutdown_tx.send(true).unwrap();
    sweeper.await.unwrap();
}
