//! Behavior suite every backend binding must pass. Each concrete
//! backend's test module calls into these with a fresh store.

use std::sync::Arc;
use std::time::Duration;

use crate::{Backend, BackendError};

/// Round-trip, listing, deletion, TTL, and CAS basics.
pub async fn run(backend: &dyn Backend) {
    put_get_round_trip(backend).await;
    get_missing_is_not_found(backend).await;
    list_filters_expired(backend).await;
    ttl_expiry_hides_value(backend).await;
    put_forever_persists(backend).await;
    delete_and_delete_bucket(backend).await;
    cas_insert_if_absent(backend).await;
    cas_mismatch_is_compare_failed(backend).await;
    bad_components_are_rejected(backend).await;
}

async fn put_get_round_trip(backend: &dyn Backend) {
    backend
        .put(&["a", "b"], "key", b"value", None)
        .await
        .unwrap();
    assert_eq!(backend.get(&["a", "b"], "key").await.unwrap(), b"value");

    // Overwrite wins.
    backend
        .put(&["a", "b"], "key", b"value2", None)
        .await
        .unwrap();
    assert_eq!(backend.get(&["a", "b"], "key").await.unwrap(), b"value2");
}

async fn get_missing_is_not_found(backend: &dyn Backend) {
    let err = backend.get(&["a", "b"], "absent").await.unwrap_err();
    assert!(err.is_not_found(), "expected not-found, got {err}");
    let err = backend.get(&["no", "bucket"], "absent").await.unwrap_err();
    assert!(err.is_not_found(), "expected not-found, got {err}");
}

async fn list_filters_expired(backend: &dyn Backend) {
    backend.put(&["listing"], "live", b"1", None).await.unwrap();
    backend
        .put(&["listing"], "dying", b"2", Some(Duration::from_millis(20)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(backend.list(&["listing"]).await.unwrap(), vec!["live"]);
    assert!(backend.list(&["listing-missing"]).await.unwrap().is_empty());
}

async fn ttl_expiry_hides_value(backend: &dyn Backend) {
    backend
        .put(&["ttl"], "key", b"v", Some(Duration::from_millis(30)))
        .await
        .unwrap();
    assert_eq!(backend.get(&["ttl"], "key").await.unwrap(), b"v");

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(backend.get(&["ttl"], "key").await.unwrap_err().is_not_found());
}

async fn put_forever_persists(backend: &dyn Backend) {
    backend.put(&["forever"], "key", b"v", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.get(&["forever"], "key").await.unwrap(), b"v");
}

async fn delete_and_delete_bucket(backend: &dyn Backend) {
    backend.put(&["del"], "key", b"v", None).await.unwrap();
    backend.delete(&["del"], "key").await.unwrap();
    assert!(backend.get(&["del"], "key").await.unwrap_err().is_not_found());
    assert!(backend.delete(&["del"], "key").await.unwrap_err().is_not_found());

    backend.put(&["del"], "other", b"v", None).await.unwrap();
    backend.delete_bucket(&["del"]).await.unwrap();
    assert!(backend.list(&["del"]).await.unwrap().is_empty());
}

async fn cas_insert_if_absent(backend: &dyn Backend) {
    backend
        .compare_and_swap(&["cas"], "fresh", None, b"v1", None)
        .await
        .unwrap();
    // A second insert-if-absent must observe the first.
    let err = backend
        .compare_and_swap(&["cas"], "fresh", None, b"v2", None)
        .await
        .unwrap_err();
    assert!(err.is_compare_failed(), "expected compare-failed, got {err}");

    // Expired entries count as absent.
    backend
        .put(&["cas"], "lapsing", b"old", Some(Duration::from_millis(20)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    backend
        .compare_and_swap(&["cas"], "lapsing", None, b"new", None)
        .await
        .unwrap();
}

async fn cas_mismatch_is_compare_failed(backend: &dyn Backend) {
    backend.put(&["cas"], "guarded", b"one", None).await.unwrap();

    let err = backend
        .compare_and_swap(&["cas"], "guarded", Some(b"wrong"), b"two", None)
        .await
        .unwrap_err();
    assert!(err.is_compare_failed());
    assert_eq!(backend.get(&["cas"], "guarded").await.unwrap(), b"one");

    backend
        .compare_and_swap(&["cas"], "guarded", Some(b"one"), b"two", None)
        .await
        .unwrap();
    assert_eq!(backend.get(&["cas"], "guarded").await.unwrap(), b"two");

    // Absent key with a concrete expectation also fails the compare.
    let err = backend
        .compare_and_swap(&["cas"], "gone", Some(b"one"), b"two", None)
        .await
        .unwrap_err();
    assert!(err.is_compare_failed());
}

async fn bad_components_are_rejected(backend: &dyn Backend) {
    let err = backend.put(&["../up"], "key", b"v", None).await.unwrap_err();
    assert!(matches!(err, BackendError::BadParameter(_)));
    let err = backend.get(&["ok"], "a/b").await.unwrap_err();
    assert!(matches!(err, BackendError::BadParameter(_)));
    let err = backend.put(&[], "key", b"v", None).await.unwrap_err();
    assert!(matches!(err, BackendError::BadParameter(_)));
}

/// Two tasks race the same compare-and-swap; exactly one may win. This
/// is the primitive single-use token consumption rides on.
pub async fn concurrent_cas_single_winner(backend: Arc<dyn Backend>) {
    backend
        .put(&["race"], "token", b"live", None)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let backend = backend.clone();
        tasks.push(tokio::spawn(async move {
            backend
                .compare_and_swap(&["race"], "token", Some(b"live"), b"consumed", None)
                .await
        }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => wins += 1,
            Err(e) if e.is_compare_failed() => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 1);
}

/// A held lock excludes a second acquirer until released; an expired
/// lock can be taken over.
pub async fn lock_contention(backend: Arc<dyn Backend>) {
    backend
        .acquire_lock("init", Duration::from_secs(5))
        .await
        .unwrap();

    let contender = {
        let backend = backend.clone();
        tokio::spawn(async move { backend.acquire_lock("init", Duration::from_secs(5)).await })
    };

    // The contender must still be waiting while we hold the lock.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!contender.is_finished());

    backend.release_lock("init").await.unwrap();
    contender.await.unwrap().unwrap();
    backend.release_lock("init").await.unwrap();

    // Crashed-holder simulation: a short-TTL lock frees itself.
    backend
        .acquire_lock("stale", Duration::from_millis(50))
        .await
        .unwrap();
    backend
        .acquire_lock("stale", Duration::from_secs(5))
        .await
        .unwrap();
    backend.release_lock("stale").await.unwrap();

    // Releasing an unheld lock is a quiet no-op.
    backend.release_lock("never-held").await.unwrap();
}
