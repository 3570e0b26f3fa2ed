//! Worker pool driving the [`Reconciler`] from the work queue.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::FutureExt;
use metrics::{counter, histogram};
use tabby_core::{Cat, ObjectKey};
use tabby_queue::{default_controller_rate_limiter, RateLimitConfig, RateLimitingQueue};
use tabby_store::{HasSynced, Lister};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::reconciler::{Outcome, ReconcileError, Reconciler};
use crate::router::EventRouter;
use crate::QUEUE_NAME;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of concurrent workers.
    pub threads: usize,
    pub rate_limit: RateLimitConfig,
    /// `None` waits for cache sync until shutdown.
    pub cache_sync_timeout: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { threads: 2, rate_limit: RateLimitConfig::default(), cache_sync_timeout: Some(Duration::from_secs(120)) }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("failed to wait for caches to sync: {0}")]
    CacheSync(String),
    #[error("worker task failed: {0}")]
    Join(String),
}

#[derive(Clone)]
struct Worker {
    reconciler: Arc<Reconciler>,
    queue: RateLimitingQueue<ObjectKey>,
}

impl Worker {
    async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let started = Instant::now();
        let result = AssertUnwindSafe(self.reconciler.reconcile(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(ReconcileError::Panicked(panic_message(payload.as_ref()))));
        histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(outcome) => {
                self.queue.forget(&key);
                counter!("reconcile_total", 1u64, "outcome" => outcome.as_str());
                match outcome {
                    Outcome::Synced => info!(key = %key, "successfully synced"),
                    Outcome::Dropped(reason) => debug!(key = %key, reason = ?reason, "dropped"),
                }
            }
            Err(e) => {
                counter!("reconcile_total", 1u64, "outcome" => "error", "error" => e.as_str());
                counter!("workqueue_retries_total", 1u64, "name" => QUEUE_NAME);
                self.queue.add_rate_limited(key.clone());
                warn!(key = %key, requeues = self.queue.num_requeues(&key), error = %e, "error syncing; requeuing");
            }
        }
        self.queue.done(&key);
        true
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Owns the work queue and the worker pool. Build the [`EventRouter`] from
/// it with [`Controller::router`] so both share the queue.
pub struct Controller {
    worker: Worker,
    caches: Vec<Arc<dyn HasSynced>>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(reconciler: Reconciler, caches: Vec<Arc<dyn HasSynced>>, config: ControllerConfig) -> Self {
        let queue = RateLimitingQueue::new(QUEUE_NAME, default_controller_rate_limiter(&config.rate_limit));
        Self { worker: Worker { reconciler: Arc::new(reconciler), queue }, caches, config }
    }

    pub fn queue(&self) -> RateLimitingQueue<ObjectKey> {
        self.worker.queue.clone()
    }

    pub fn router(&self, cats: Arc<dyn Lister<Cat>>) -> EventRouter {
        EventRouter::new(cats, self.queue())
    }

    /// Pop one key and run a pass for it. Returns `false` once the queue is
    /// shut down and drained.
    pub async fn process_next_item(&self) -> bool {
        self.worker.process_next_item().await
    }

    /// Wait for the caches, run the workers until `shutdown` fires, then
    /// drain the queue and join every worker.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        info!(threads = self.config.threads, "starting cat controller");
        if let Err(e) = self.wait_for_caches(&shutdown).await {
            self.worker.queue.shutdown();
            return Err(e);
        }

        let mut workers = JoinSet::new();
        for id in 0..self.config.threads.max(1) {
            let worker = self.worker.clone();
            workers.spawn(async move {
                while worker.process_next_item().await {}
                debug!(worker = id, "worker stopped");
            });
        }
        info!("started workers");

        shutdown.cancelled().await;
        info!("shutting down workers");
        self.worker.queue.shutdown_with_drain().await;

        let mut result = Ok(());
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker task failed");
                result = Err(ControllerError::Join(e.to_string()));
            }
        }
        info!("cat controller stopped");
        result
    }

    async fn wait_for_caches(&self, shutdown: &CancellationToken) -> Result<(), ControllerError> {
        info!(caches = self.caches.len(), "waiting for informer caches to sync");
        let synced = join_all(self.caches.iter().map(|c| c.wait_synced()));
        let timeout = async {
            match self.config.cache_sync_timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = synced => {
                info!("caches synced");
                Ok(())
            }
            _ = shutdown.cancelled() => Err(ControllerError::CacheSync("shutdown before sync".into())),
            _ = timeout => Err(ControllerError::CacheSync(format!(
                "timed out after {:?}",
                self.config.cache_sync_timeout.unwrap_or_default()
            ))),
        }
    }
}
