//! End-to-end rollback behavior over the in-memory ports: staleness,
//! atomicity, and the rollback-the-rollback round trip.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use audit_core::cache::InMemoryReportCache;
use audit_core::memory::*;
use audit_core::ports::{ChangeLogStore, EntityDirectory, EntityRepository};
use audit_core::types::*;
use audit_core::{ChangeTracker, RollbackService};

struct Harness {
    ledger: Arc<InMemoryChangeLog>,
    services: Arc<InMemoryEntityRepository>,
    tracker: Arc<ChangeTracker>,
    rollback_store: Arc<InMemoryRollbackStore>,
    service: RollbackService,
    tenant: Uuid,
}

fn state(pairs: &[(&str, serde_json::Value)]) -> StateMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn harness() -> Harness {
    let ledger = Arc::new(InMemoryChangeLog::new());
    let services = Arc::new(InMemoryEntityRepository::new(EntityKind::UtilityService));
    let configs = Arc::new(InMemoryEntityRepository::new(
        EntityKind::ServiceConfiguration,
    ));
    let directory = EntityDirectory::new()
        .register(services.clone())
        .register(configs.clone());
    let rollback_store = Arc::new(InMemoryRollbackStore::new(
        ledger.clone(),
        [services.clone(), configs],
    ));
    let tracker = Arc::new(ChangeTracker::new(
        ledger.clone(),
        directory,
        rollback_store.clone(),
        Arc::new(InMemoryReportCache::new()),
    ));
    let service = RollbackService::new(
        tracker.clone(),
        ledger.clone(),
        rollback_store.clone(),
        Arc::new(RecordingNotifier::new()),
    );
    Harness {
        ledger,
        services,
        tracker,
        rollback_store,
        service,
        tenant: Uuid::new_v4(),
    }
}

async fn seed_update(h: &Harness, entity: Uuid, old: StateMap, new: StateMap) -> ChangeRecord {
    h.services.insert(entity, new.clone()).await;
    h.ledger
        .append(NewChangeRecord {
            entity_kind: EntityKind::UtilityService,
            entity_id: entity,
            tenant_id: h.tenant,
            actor_id: Some(Uuid::new_v4()),
            event: ChangeEvent::Updated,
            old_state: Some(old),
            new_state: Some(new),
            note: None,
            metadata: json!({}),
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn staleness_invariant_any_later_change_blocks_rollback() {
    let h = harness();
    let entity = Uuid::new_v4();
    let first = seed_update(
        &h,
        entity,
        state(&[("name", json!("A"))]),
        state(&[("name", json!("B"))]),
    )
    .await;
    let second = seed_update(
        &h,
        entity,
        state(&[("name", json!("B"))]),
        state(&[("name", json!("C"))]),
    )
    .await;

    // The superseded change can never be rolled back...
    let validation = h.service.validate(first.id).await.unwrap();
    assert!(!validation.valid);
    let candidate = h.tracker.rollback_candidate(first.id).await.unwrap().unwrap();
    assert!(!candidate.can_rollback);

    // ...while the most recent one can.
    let validation = h.service.validate(second.id).await.unwrap();
    assert!(validation.valid, "{:?}", validation.errors);
}

#[tokio::test]
async fn rollback_of_the_rollback_restores_the_original_new_state() {
    let h = harness();
    let entity = Uuid::new_v4();
    let change = seed_update(
        &h,
        entity,
        state(&[("name", json!("A")), ("pricing", json!(10))]),
        state(&[("name", json!("B")), ("pricing", json!(12))]),
    )
    .await;

    let outcome = h
        .service
        .perform(change.id, Uuid::new_v4(), None, false, false)
        .await
        .unwrap();
    assert!(outcome.success);
    let rollback_id = outcome.rollback_id.unwrap();

    let after_first = h.services.current_state(entity).await.unwrap().unwrap();
    assert_eq!(after_first["name"], json!("A"));
    assert_eq!(after_first["pricing"], json!(10));

    // Rolling back the rollback record itself restores the state the
    // original change had produced.
    let outcome = h
        .service
        .perform(rollback_id, Uuid::new_v4(), None, false, false)
        .await
        .unwrap();
    assert!(outcome.success, "{:?}", outcome.errors);

    let round_tripped = h.services.current_state(entity).await.unwrap().unwrap();
    assert_eq!(round_tripped["name"], json!("B"));
    assert_eq!(round_tripped["pricing"], json!(12));
}

#[tokio::test]
async fn failed_transaction_leaves_no_partial_state() {
    let h = harness();
    let entity = Uuid::new_v4();
    let change = seed_update(
        &h,
        entity,
        state(&[("name", json!("A"))]),
        state(&[("name", json!("B"))]),
    )
    .await;

    let rows_before = h
        .ledger
        .changes_for_entity(EntityKind::UtilityService, entity, None, None)
        .await
        .unwrap()
        .len();

    h.rollback_store.fail_before_append(true);
    let outcome = h
        .service
        .perform(change.id, Uuid::new_v4(), None, false, false)
        .await
        .unwrap();
    assert!(!outcome.success);

    // Fully unapplied: entity untouched, ledger untouched.
    let current = h.services.current_state(entity).await.unwrap().unwrap();
    assert_eq!(current["name"], json!("B"));
    let rows_after = h
        .ledger
        .changes_for_entity(EntityKind::UtilityService, entity, None, None)
        .await
        .unwrap()
        .len();
    assert_eq!(rows_after, rows_before);

    // After the fault clears, the same rollback applies cleanly.
    h.rollback_store.fail_before_append(false);
    let outcome = h
        .service
        .perform(change.id, Uuid::new_v4(), None, false, false)
        .await
        .unwrap();
    assert!(outcome.success);
    let current = h.services.current_state(entity).await.unwrap().unwrap();
    assert_eq!(current["name"], json!("A"));
}

#[tokio::test]
async fn concurrent_rollbacks_of_the_same_change_cannot_both_succeed() {
    let h = harness();
    let entity = Uuid::new_v4();
    let change = seed_update(
        &h,
        entity,
        state(&[("name", json!("A"))]),
        state(&[("name", json!("B"))]),
    )
    .await;

    let (a, b) = tokio::join!(
        h.service
            .perform(change.id, Uuid::new_v4(), None, false, false),
        h.service
            .perform(change.id, Uuid::new_v4(), None, false, false),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(
        a.success ^ b.success,
        "exactly one rollback must win: a={} b={}",
        a.success,
        b.success
    );

    // The ledger carries exactly one rollback entry.
    let rollbacks = h
        .ledger
        .rollbacks_for_entity(EntityKind::UtilityService, entity)
        .await
        .unwrap();
    assert_eq!(rollbacks.len(), 1);
    let current = h.services.current_state(entity).await.unwrap().unwrap();
    assert_eq!(current["name"], json!("A"));
}

#[tokio::test]
async fn thin_tracker_rollback_reverts_and_reports_eligibility() {
    let h = harness();
    let entity = Uuid::new_v4();
    let change = seed_update(
        &h,
        entity,
        state(&[("name", json!("A"))]),
        state(&[("name", json!("B"))]),
    )
    .await;

    let actor = Uuid::new_v4();
    assert!(h
        .tracker
        .execute_rollback(change.id, actor, Some("misconfigured"))
        .await
        .unwrap());
    let current = h.services.current_state(entity).await.unwrap().unwrap();
    assert_eq!(current["name"], json!("A"));

    // The same change is now stale: thin path reports false, not an error.
    assert!(!h
        .tracker
        .execute_rollback(change.id, actor, None)
        .await
        .unwrap());

    // Unknown change id reports false as well.
    assert!(!h
        .tracker
        .execute_rollback(Uuid::new_v4(), actor, None)
        .await
        .unwrap());
}

#[tokio::test]
async fn deleted_entity_cannot_be_rolled_back() {
    let h = harness();
    let entity = Uuid::new_v4();
    let change = seed_update(
        &h,
        entity,
        state(&[("name", json!("A"))]),
        state(&[("name", json!("B"))]),
    )
    .await;
    h.services.remove(entity).await;

    let candidate = h.tracker.rollback_candidate(change.id).await.unwrap().unwrap();
    assert!(!candidate.can_rollback);

    let outcome = h
        .service
        .perform(change.id, Uuid::new_v4(), None, false, false)
        .await
        .unwrap();
    assert!(!outcome.success);
}

#[tokio::test]
async fn record_without_old_state_yields_no_candidate() {
    let h = harness();
    let entity = Uuid::new_v4();
    h.services.insert(entity, state(&[("name", json!("A"))])).await;
    let created = h
        .ledger
        .append(NewChangeRecord {
            entity_kind: EntityKind::UtilityService,
            entity_id: entity,
            tenant_id: h.tenant,
            actor_id: None,
            event: ChangeEvent::Created,
            old_state: None,
            new_state: Some(state(&[("name", json!("A"))])),
            note: None,
            metadata: json!({}),
        })
        .await
        .unwrap();

    assert!(h
        .tracker
        .rollback_candidate(created.id)
        .await
        .unwrap()
        .is_none());
}
