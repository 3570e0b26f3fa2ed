//! Event routing: every cache notification becomes (at most) one Cat key.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use metrics::counter;
use tabby_core::owner::{controller_of, is_cat_ref};
use tabby_core::{Cat, ObjectKey};
use tabby_queue::RateLimitingQueue;
use tabby_store::{Lister, StoreEvent};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// A change the controller cares about.
#[derive(Debug, Clone)]
pub enum Notification {
    CatChanged(Arc<Cat>),
    DeploymentChanged { old: Option<Arc<Deployment>>, new: Arc<Deployment> },
    DeploymentDeleted { obj: Arc<Deployment>, final_state_unknown: bool },
}

impl Notification {
    /// Cat deletions are not routed: the pass would only find nothing to do.
    pub fn from_cat_event(ev: StoreEvent<Cat>) -> Option<Self> {
        match ev {
            StoreEvent::Added(cat) | StoreEvent::Updated { new: cat, .. } => Some(Self::CatChanged(cat)),
            StoreEvent::Deleted { .. } => None,
        }
    }

    pub fn from_deployment_event(ev: StoreEvent<Deployment>) -> Self {
        match ev {
            StoreEvent::Added(new) => Self::DeploymentChanged { old: None, new },
            StoreEvent::Updated { old, new } => Self::DeploymentChanged { old: Some(old), new },
            StoreEvent::Deleted { obj, final_state_unknown } => Self::DeploymentDeleted { obj, final_state_unknown },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Enqueued(ObjectKey),
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Update with an unchanged resourceVersion (periodic resync).
    ResyncEcho,
    /// No controller owner reference.
    NoController,
    /// Controlled by something other than a Cat.
    ForeignOwner,
    /// Controlling Cat is not in the cache.
    Orphaned,
    /// Cat cache lookup failed.
    LookupFailed,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::ResyncEcho => "resync_echo",
            IgnoreReason::NoController => "no_controller",
            IgnoreReason::ForeignOwner => "foreign_owner",
            IgnoreReason::Orphaned => "orphaned",
            IgnoreReason::LookupFailed => "lookup_failed",
        }
    }
}

pub struct EventRouter {
    cats: Arc<dyn Lister<Cat>>,
    queue: RateLimitingQueue<ObjectKey>,
}

impl EventRouter {
    pub fn new(cats: Arc<dyn Lister<Cat>>, queue: RateLimitingQueue<ObjectKey>) -> Self {
        Self { cats, queue }
    }

    pub fn route(&self, notification: Notification) -> RouteDecision {
        let decision = match notification {
            Notification::CatChanged(cat) => self.enqueue(ObjectKey::from_resource(&*cat)),
            Notification::DeploymentChanged { old: Some(old), new }
                if old.resource_version() == new.resource_version() =>
            {
                RouteDecision::Ignored(IgnoreReason::ResyncEcho)
            }
            Notification::DeploymentChanged { new, .. } => self.handle_object(&new),
            Notification::DeploymentDeleted { obj, final_state_unknown } => {
                if final_state_unknown {
                    info!(object = %ObjectKey::from_resource(&*obj), "recovered deleted object from tombstone");
                }
                self.handle_object(&obj)
            }
        };
        if let RouteDecision::Ignored(reason) = decision {
            counter!("router_ignored_total", 1u64, "reason" => reason.as_str());
        }
        decision
    }

    /// Enqueue the Cat controlling `deployment`, if there is one.
    fn handle_object(&self, deployment: &Deployment) -> RouteDecision {
        let object = ObjectKey::from_resource(deployment);
        trace!(object = %object, "processing object");
        let Some(owner) = controller_of(deployment) else {
            return RouteDecision::Ignored(IgnoreReason::NoController);
        };
        if !is_cat_ref(owner) {
            return RouteDecision::Ignored(IgnoreReason::ForeignOwner);
        }
        match self.cats.get(deployment.namespace().as_deref(), &owner.name) {
            Ok(Some(cat)) => self.enqueue(ObjectKey::from_resource(&*cat)),
            Ok(None) => {
                debug!(object = %object, cat = %owner.name, "ignoring orphaned object");
                RouteDecision::Ignored(IgnoreReason::Orphaned)
            }
            Err(e) => {
                warn!(object = %object, cat = %owner.name, error = %e, "owner lookup failed; ignoring");
                RouteDecision::Ignored(IgnoreReason::LookupFailed)
            }
        }
    }

    fn enqueue(&self, key: ObjectKey) -> RouteDecision {
        self.queue.add_rate_limited(key.clone());
        RouteDecision::Enqueued(key)
    }

    /// Route notifications from both caches until `shutdown` fires or a
    /// cache goes away.
    pub async fn run(
        self,
        mut cats: UnboundedReceiver<StoreEvent<Cat>>,
        mut deployments: UnboundedReceiver<StoreEvent<Deployment>>,
        shutdown: CancellationToken,
    ) {
        info!("event router started");
        loop {
            let notification = tokio::select! {
                _ = shutdown.cancelled() => break,
                ev = cats.recv() => match ev {
                    Some(ev) => Notification::from_cat_event(ev),
                    None => break,
                },
                ev = deployments.recv() => match ev {
                    Some(ev) => Some(Notification::from_deployment_event(ev)),
                    None => break,
                },
            };
            if let Some(n) = notification {
                self.route(n);
            }
        }
        info!("event router stopped");
    }
}
