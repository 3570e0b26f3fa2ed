use tabby_controller::reconciler::{ERR_INVALID, ERR_RESOURCE_EXISTS, MESSAGE_RESOURCE_SYNCED, SUCCESS_SYNCED};
use tabby_controller::testing::{cat, foreign_deployment, Harness};
use tabby_controller::{EventType, Outcome, ReconcileError};
use tabby_core::owner::is_controlled_by;
use tabby_core::{CatConditionType, ConditionStatus, ObjectKey};

fn billie() -> ObjectKey {
    ObjectKey::namespaced("ns1", "billie")
}

#[tokio::test]
async fn new_cat_gets_one_owned_deployment_and_ready_status() {
    let h = Harness::new();
    h.cats.apply(cat("ns1", "billie", "billie"));
    let r = h.reconciler();

    assert_eq!(r.reconcile(&billie()).await.unwrap(), Outcome::Synced);

    let created = h.deployment_client.created();
    assert_eq!(created.len(), 1);
    let owner = h.cats.get(&billie()).unwrap();
    assert!(is_controlled_by(&created[0], &owner));
    assert_eq!(created[0].metadata.namespace.as_deref(), Some("ns1"));
    assert_eq!(created[0].metadata.name.as_deref(), Some("billie"));

    let status = owner.status.clone().expect("status mirrored into the cache");
    let ready = status.condition(CatConditionType::Ready).unwrap();
    assert_eq!(ready.status, ConditionStatus::True);

    let events = h.recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].subject, billie());
    assert_eq!(events[0].type_, EventType::Normal);
    assert_eq!(events[0].reason, SUCCESS_SYNCED);
    assert_eq!(events[0].message, MESSAGE_RESOURCE_SYNCED);

    // second pass sees the Deployment in the cache: status only
    assert_eq!(r.reconcile(&billie()).await.unwrap(), Outcome::Synced);
    assert_eq!(h.deployment_client.calls(), 1);
    assert_eq!(h.cat_client.updates().len(), 2);
    assert_eq!(h.recorder.reasons(), vec![SUCCESS_SYNCED, SUCCESS_SYNCED]);
}

#[tokio::test]
async fn repeated_passes_are_idempotent() {
    let h = Harness::new();
    h.cats.apply(cat("ns1", "billie", "billie"));
    let r = h.reconciler();
    for _ in 0..5 {
        assert_eq!(r.reconcile(&billie()).await.unwrap(), Outcome::Synced);
    }
    assert_eq!(h.deployment_client.created().len(), 1);
    assert_eq!(h.deployments.len(), 1);

    // lastTransitionTime is kept once the condition is stable
    let first = h.cat_client.updates()[1].status.clone().unwrap();
    let last = h.cat_client.updates()[4].status.clone().unwrap();
    assert_eq!(
        first.condition(CatConditionType::Ready).unwrap().last_transition_time,
        last.condition(CatConditionType::Ready).unwrap().last_transition_time
    );
}

#[tokio::test]
async fn empty_name_is_rejected_before_any_mutation() {
    let h = Harness::new();
    h.cats.apply(cat("ns1", "billie", ""));

    let err = h.reconciler().reconcile(&billie()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Validation(_)));
    assert_eq!(h.mutations(), 0);
    assert!(h.deployments.is_empty());

    let events = h.recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].type_, EventType::Warning);
    assert_eq!(events[0].reason, ERR_INVALID);
    assert!(events[0].message.contains("spec.name"));
}

#[tokio::test]
async fn unowned_deployment_is_a_conflict_without_mutation() {
    let h = Harness::new();
    h.deployments.apply(foreign_deployment("ns1", "billie"));
    h.cats.apply(cat("ns1", "billie", "billie"));

    let err = h.reconciler().reconcile(&billie()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Conflict(_)));
    assert_eq!(h.mutations(), 0);

    let events = h.recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].type_, EventType::Warning);
    assert_eq!(events[0].reason, ERR_RESOURCE_EXISTS);
    assert_eq!(events[0].message, r#"Resource "billie" already exists and is not managed by Cat "ns1/billie""#);
}

#[tokio::test]
async fn deployment_of_a_recreated_cat_is_a_conflict() {
    let h = Harness::new();
    h.cats.apply(cat("ns1", "billie", "billie"));
    h.reconciler().reconcile(&billie()).await.unwrap();

    // same name, new uid: the old Deployment belongs to the previous Cat
    let mut reborn = cat("ns1", "billie", "billie");
    reborn.metadata.uid = Some("uid-reborn".into());
    h.cats.apply(reborn);

    let err = h.reconciler().reconcile(&billie()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Conflict(_)));
    assert_eq!(h.deployment_client.calls(), 1);
}

#[tokio::test]
async fn create_racing_the_cache_is_retryable() {
    let h = Harness::new();
    h.cats.apply(cat("ns1", "billie", "billie"));
    // someone else's write landed on the server, the cache has not seen it
    let c = h.cats.get(&billie()).unwrap();
    let other = tabby_controller::testing::owned_deployment(&c);
    h.deployment_client.fail_with(Some(tabby_controller::ClientError::AlreadyExists("billie".into())));

    let err = h.reconciler().reconcile(&billie()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Create { .. }));

    h.deployment_client.fail_with(None);
    h.deployments.apply(other);
    assert_eq!(h.reconciler().reconcile(&billie()).await.unwrap(), Outcome::Synced);
    assert!(h.deployment_client.created().is_empty());
}
