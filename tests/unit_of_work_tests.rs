/// Unit of work: explicit transactions, save_changes and conflict merging.
///
/// Run with: cargo test --test unit_of_work_tests
mod common;

use common::{Agency, Appointment, Booking, FaultyStore, manual_config, registry};
use coordb::{
    CoordError, CoordinationRegistry, OutcomeStatus, PendingWork, UnitOfWork, resolver_fn,
};
use std::sync::Arc;

#[tokio::test]
async fn test_two_writers_default_merge_keeps_last_intent() {
    let store = FaultyStore::new();
    let registry = registry(store.clone(), manual_config());
    let seed = Booking::new(registry.clone()).unwrap();
    let agency = Agency::new("North", 3);
    seed.agencies().save(agency.clone()).await.unwrap();

    let first = Booking::new(registry.clone()).unwrap();
    let second = Booking::new(registry).unwrap();
    let mut renamed = first.agencies().get(&agency.id).await.unwrap().unwrap();
    let mut resized = second.agencies().get(&agency.id).await.unwrap().unwrap();

    renamed.name = "North Harbour".into();
    first.agencies().update(renamed).await.unwrap();

    resized.capacity = 2;
    let outcome = second.agencies().update(resized.clone()).await.unwrap();
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.version, Some(3));

    // Every non-key field comes from the second writer's snapshot.
    let stored = store.stored::<Agency>(&agency.id).await.unwrap();
    assert_eq!(stored, resized);
    assert_eq!(stored.name, "North");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_writers_both_succeed() {
    let store = FaultyStore::new();
    let registry = registry(store.clone(), manual_config());
    let seed = Booking::new(registry.clone()).unwrap();
    let agency = Agency::new("North", 3);
    seed.agencies().save(agency.clone()).await.unwrap();

    let first = Arc::new(Booking::new(registry.clone()).unwrap());
    let second = Arc::new(Booking::new(registry).unwrap());
    let mut renamed = first.agencies().get(&agency.id).await.unwrap().unwrap();
    let mut resized = second.agencies().get(&agency.id).await.unwrap().unwrap();
    assert_eq!(first.agencies().tracked_version(&agency.id), Some(1));
    assert_eq!(second.agencies().tracked_version(&agency.id), Some(1));
    renamed.name = "North Harbour".into();
    resized.capacity = 2;

    let renaming = {
        let (uow, entity) = (first.clone(), renamed.clone());
        tokio::spawn(async move { uow.agencies().update(entity).await })
    };
    let resizing = {
        let (uow, entity) = (second.clone(), resized.clone());
        tokio::spawn(async move { uow.agencies().update(entity).await })
    };
    let (renaming, resizing) = tokio::join!(renaming, resizing);
    let renaming = renaming.unwrap().unwrap();
    let resizing = resizing.unwrap().unwrap();

    let mut attempts = [renaming.attempts, resizing.attempts];
    attempts.sort_unstable();
    assert_eq!(attempts, [1, 2]);

    // The writer that lost the race was merged onto the winner's row.
    let (merged, outcome) = if resizing.attempts == 2 {
        (resized, resizing)
    } else {
        (renamed, renaming)
    };
    assert_eq!(outcome.version, Some(3));
    assert_eq!(store.stored::<Agency>(&agency.id).await, Some(merged));
    assert_eq!(store.commits(), 4);
}

#[tokio::test]
async fn test_custom_resolver_keeps_concurrent_rename() {
    let store = FaultyStore::new();
    let registry = Arc::new(
        CoordinationRegistry::new(store.clone(), manual_config())
            .unwrap()
            .with_resolver::<Agency, _>(resolver_fn(|stored: Agency, intended: &Agency| Agency {
                capacity: intended.capacity,
                ..stored
            })),
    );
    let seed = Booking::new(registry.clone()).unwrap();
    let agency = Agency::new("North", 3);
    seed.agencies().save(agency.clone()).await.unwrap();

    let first = Booking::new(registry.clone()).unwrap();
    let second = Booking::new(registry).unwrap();
    let mut renamed = first.agencies().get(&agency.id).await.unwrap().unwrap();
    let mut resized = second.agencies().get(&agency.id).await.unwrap().unwrap();

    renamed.name = "North Harbour".into();
    first.agencies().update(renamed).await.unwrap();
    resized.capacity = 2;
    second.agencies().update(resized).await.unwrap();

    let stored = store.stored::<Agency>(&agency.id).await.unwrap();
    assert_eq!(stored.name, "North Harbour");
    assert_eq!(stored.capacity, 2);
}

#[tokio::test]
async fn test_save_changes_commits_all_kinds_once() {
    let store = FaultyStore::new();
    let uow = Booking::new(registry(store.clone(), manual_config())).unwrap();

    let agency = Agency::new("North", 3);
    let appointment = Appointment::new(agency.id, "09:00");
    uow.agencies().enqueue_save(agency.clone());
    uow.appointments().enqueue_save(appointment.clone());
    assert!(uow.agencies().has_pending());

    let report = uow.save_changes().await.unwrap();
    assert_eq!(report.outcomes.len(), 2);
    assert!(
        report
            .outcomes
            .iter()
            .all(|outcome| outcome.status == OutcomeStatus::Staged)
    );
    let receipt = report.receipt.unwrap();
    assert_eq!(receipt.versions.len(), 2);
    assert_eq!(store.commits(), 1);

    assert_eq!(store.stored::<Agency>(&agency.id).await, Some(agency.clone()));
    assert_eq!(
        store.stored::<Appointment>(&appointment.id).await,
        Some(appointment.clone())
    );
    assert_eq!(uow.agencies().tracked_version(&agency.id), Some(1));
    assert_eq!(uow.appointments().tracked_version(&appointment.id), Some(1));
    assert!(!uow.agencies().has_pending());
}

#[tokio::test]
async fn test_save_changes_without_changes_is_empty() {
    let store = FaultyStore::new();
    let uow = Booking::new(registry(store.clone(), manual_config())).unwrap();
    let report = uow.save_changes().await.unwrap();
    assert!(report.is_empty());
    assert!(report.receipt.is_none());
    assert_eq!(store.commits(), 0);
}

#[tokio::test]
async fn test_save_changes_conflict_applies_nothing() {
    let store = FaultyStore::new();
    let registry = registry(store.clone(), manual_config());
    let seed = Booking::new(registry.clone()).unwrap();
    let agency = Agency::new("North", 3);
    seed.agencies().save(agency.clone()).await.unwrap();

    let stale = Booking::new(registry.clone()).unwrap();
    let mut mine = stale.agencies().get(&agency.id).await.unwrap().unwrap();

    let mut theirs = agency.clone();
    theirs.capacity = 1;
    seed.agencies().update(theirs.clone()).await.unwrap();

    let appointment = Appointment::new(agency.id, "10:00");
    mine.capacity = 5;
    stale.agencies().enqueue_update(mine);
    stale.appointments().enqueue_save(appointment.clone());

    let err = stale.save_changes().await.unwrap_err();
    assert!(matches!(err, CoordError::ConcurrencyConflict { attempts: 1, .. }));
    assert_eq!(store.stored::<Agency>(&agency.id).await, Some(theirs));
    assert_eq!(store.stored::<Appointment>(&appointment.id).await, None);
    assert_eq!(store.open_transactions().await, 0);
    assert_eq!(stale.agencies().tracked_version(&agency.id), None);
}

#[tokio::test]
async fn test_explicit_transaction_commit() {
    let store = FaultyStore::new();
    let uow = Booking::new(registry(store.clone(), manual_config())).unwrap();

    uow.begin_transaction().await.unwrap();
    assert!(uow.context().in_transaction());

    let agency = Agency::new("North", 3);
    let outcome = uow.agencies().save(agency.clone()).await.unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Staged);
    uow.appointments()
        .enqueue_save(Appointment::new(agency.id, "11:00"));

    // Visible inside the transaction only.
    assert_eq!(uow.agencies().get(&agency.id).await.unwrap(), Some(agency.clone()));
    assert_eq!(store.stored::<Agency>(&agency.id).await, None);

    let receipt = uow.commit_transaction().await.unwrap();
    assert_eq!(receipt.versions.len(), 2);
    assert!(!uow.context().in_transaction());
    assert_eq!(store.stored::<Agency>(&agency.id).await, Some(agency.clone()));
    assert_eq!(uow.agencies().tracked_version(&agency.id), Some(1));
}

#[tokio::test]
async fn test_explicit_transaction_rollback() {
    let store = FaultyStore::new();
    let uow = Booking::new(registry(store.clone(), manual_config())).unwrap();

    uow.begin_transaction().await.unwrap();
    let agency = Agency::new("North", 3);
    uow.agencies().save(agency.clone()).await.unwrap();
    uow.appointments()
        .enqueue_save(Appointment::new(agency.id, "12:00"));

    uow.rollback_transaction().await.unwrap();
    assert!(!uow.context().in_transaction());
    assert!(!uow.appointments().has_pending());
    assert_eq!(store.stored::<Agency>(&agency.id).await, None);
    assert_eq!(store.open_transactions().await, 0);
}

#[tokio::test]
async fn test_rollback_without_transaction_is_noop() {
    let store = FaultyStore::new();
    let uow = Booking::new(registry(store, manual_config())).unwrap();
    assert!(uow.rollback_transaction().await.is_ok());
}

#[tokio::test]
async fn test_nested_begin_is_rejected() {
    let store = FaultyStore::new();
    let uow = Booking::new(registry(store, manual_config())).unwrap();
    uow.begin_transaction().await.unwrap();
    let err = uow.begin_transaction().await.unwrap_err();
    assert!(matches!(err, CoordError::Transaction(_)));
    uow.rollback_transaction().await.unwrap();
}

#[tokio::test]
async fn test_commit_without_transaction_fails() {
    let store = FaultyStore::new();
    let uow = Booking::new(registry(store, manual_config())).unwrap();
    let err = uow.commit_transaction().await.unwrap_err();
    assert!(matches!(err, CoordError::Transaction(_)));
}

#[tokio::test]
async fn test_explicit_commit_conflict_is_surfaced_once() {
    let store = FaultyStore::new();
    let registry = registry(store.clone(), manual_config());
    let seed = Booking::new(registry.clone()).unwrap();
    let agency = Agency::new("North", 3);
    seed.agencies().save(agency.clone()).await.unwrap();

    let uow = Booking::new(registry).unwrap();
    let mut mine = uow.agencies().get(&agency.id).await.unwrap().unwrap();

    uow.begin_transaction().await.unwrap();
    mine.capacity = 8;
    uow.agencies().update(mine).await.unwrap();

    let mut theirs = agency.clone();
    theirs.name = "Elsewhere".into();
    seed.agencies().update(theirs.clone()).await.unwrap();

    let err = uow.commit_transaction().await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(store.stored::<Agency>(&agency.id).await, Some(theirs));
    assert!(!uow.context().in_transaction());
}
