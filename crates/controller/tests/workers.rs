use std::sync::Arc;
use std::time::Duration;

use tabby_controller::testing::{cat, Harness};
use tabby_controller::{ClientError, Controller, ControllerConfig, ControllerError};
use tabby_core::{CatConditionType, ConditionStatus, ObjectKey};
use tabby_queue::RateLimitConfig;
use tokio_util::sync::CancellationToken;

fn fast_config() -> ControllerConfig {
    ControllerConfig {
        threads: 2,
        rate_limit: RateLimitConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(50),
            ..RateLimitConfig::default()
        },
        cache_sync_timeout: Some(Duration::from_secs(10)),
    }
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Spawn router and workers the way the binary does.
fn start(
    h: &Harness,
    ctrl: Controller,
    shutdown: &CancellationToken,
) -> tokio::task::JoinHandle<Result<(), ControllerError>> {
    let router = ctrl.router(Arc::new(h.cats.clone()));
    tokio::spawn(router.run(h.cats.subscribe(), h.deployments.subscribe(), shutdown.clone()));
    tokio::spawn(ctrl.run(shutdown.clone()))
}

fn billie_ready(h: &Harness) -> bool {
    h.cats
        .get(&ObjectKey::namespaced("ns1", "billie"))
        .and_then(|c| c.status.clone())
        .and_then(|s| s.condition(CatConditionType::Ready).map(|c| c.status == ConditionStatus::True))
        .unwrap_or(false)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn converges_end_to_end_and_settles() {
    let h = Harness::new();
    let shutdown = CancellationToken::new();
    let run = start(&h, h.controller(fast_config()), &shutdown);

    h.cats.apply(cat("ns1", "billie", "billie"));
    eventually("ready status", || billie_ready(&h)).await;

    // let the echo of our own writes play out
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.deployment_client.created().len(), 1);
    let updates = h.cat_client.calls();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.cat_client.calls(), updates, "controller should be quiescent");

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workers_wait_for_cache_sync() {
    let h = Harness::unsynced();
    let shutdown = CancellationToken::new();
    let ctrl = h.controller(fast_config());
    let queue = ctrl.queue();
    let run = start(&h, ctrl, &shutdown);

    h.cats.apply(cat("ns1", "billie", "billie"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.mutations(), 0);
    assert_eq!(queue.len(), 1, "key stays queued until the caches sync");

    h.cats.mark_synced();
    h.deployments.mark_synced();
    eventually("deployment created", || h.deployment_client.created().len() == 1).await;

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn sync_timeout_fails_run() {
    let h = Harness::unsynced();
    let config = ControllerConfig { cache_sync_timeout: Some(Duration::from_millis(50)), ..fast_config() };
    let ctrl = h.controller(config);
    let queue = ctrl.queue();
    let err = ctrl.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ControllerError::CacheSync(_)));
    assert!(queue.is_shutting_down());
}

#[tokio::test]
async fn shutdown_before_sync_fails_run() {
    let h = Harness::unsynced();
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let err = h.controller(fast_config()).run(shutdown).await.unwrap_err();
    assert!(matches!(err, ControllerError::CacheSync(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_passes_are_retried_with_backoff() {
    let h = Harness::new();
    h.deployment_client.fail_with(Some(ClientError::Api("etcd unavailable".into())));
    let shutdown = CancellationToken::new();
    let ctrl = h.controller(fast_config());
    let queue = ctrl.queue();
    let run = start(&h, ctrl, &shutdown);

    h.cats.apply(cat("ns1", "billie", "billie"));
    eventually("three attempts", || h.deployment_client.calls() >= 3).await;
    assert!(queue.num_requeues(&ObjectKey::namespaced("ns1", "billie")) >= 2);

    h.deployment_client.fail_with(None);
    eventually("ready status", || billie_ready(&h)).await;
    assert_eq!(h.deployment_client.created().len(), 1);
    eventually("backoff forgotten", || queue.num_requeues(&ObjectKey::namespaced("ns1", "billie")) == 0).await;

    shutdown.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn panicking_pass_is_contained_and_retried() {
    let h = Harness::new();
    h.cats.apply(cat("ns1", "billie", "billie"));
    h.deployment_client.panic_once();
    let ctrl = h.controller(fast_config());
    let key = ObjectKey::namespaced("ns1", "billie");

    ctrl.queue().add(key.clone());
    assert!(ctrl.process_next_item().await);
    assert_eq!(ctrl.queue().num_requeues(&key), 1);
    assert!(h.deployment_client.created().is_empty());

    // the retry lands after its backoff delay
    assert!(ctrl.process_next_item().await);
    assert_eq!(h.deployment_client.created().len(), 1);
    assert_eq!(ctrl.queue().num_requeues(&key), 0);
}

#[tokio::test]
async fn workers_exit_after_shutdown_drains_the_queue() {
    let h = Harness::new();
    let ctrl = h.controller(fast_config());
    let queue = ctrl.queue();
    for name in ["a", "b", "c"] {
        h.cats.apply(cat("ns1", name, name));
        queue.add(ObjectKey::namespaced("ns1", name));
    }
    queue.shutdown();
    while ctrl.process_next_item().await {}
    assert_eq!(h.deployment_client.created().len(), 3);
    assert!(queue.is_empty());
}
