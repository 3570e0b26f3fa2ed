//! One level-triggered reconcile pass for a Cat.
//!
//! `Fetch -> Validate -> Diagnose -> Converge -> UpdateStatus -> Report`.
//! State is read fresh from the caches on every pass; nothing is carried
//! over from the notification that queued the key.

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use kube::Resource;
use tabby_core::deployment::{deployment_name, desired_deployment};
use tabby_core::{
    validate_cat, validate_deployment, Cat, CatCondition, CatConditionType, ConditionStatus, ConflictError, ObjectKey,
    ValidationError,
};
use tabby_store::{Lister, StoreError};
use tracing::{debug, error, info};

use crate::client::{CatStatusUpdater, ClientError, DeploymentCreator, EventRecorder, EventType};

/// Event reason when a Cat is synced.
pub const SUCCESS_SYNCED: &str = "Synced";
/// Event reason when a same-named Deployment is not controlled by the Cat.
pub const ERR_RESOURCE_EXISTS: &str = "ErrResourceExists";
/// Event reason when the Cat fails validation.
pub const ERR_INVALID: &str = "ErrInvalid";
pub const MESSAGE_RESOURCE_SYNCED: &str = "Cat synced successfully";

pub const REASON_DEPLOYMENT_CREATED: &str = "DeploymentCreated";
pub const REASON_DEPLOYMENT_READY: &str = "DeploymentReady";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Synced,
    /// Nothing to do and nothing to retry.
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The Cat is gone from the cache.
    Deleted,
    /// The key can never name a Cat (Cats are namespaced).
    InvalidKey,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Synced => "synced",
            Outcome::Dropped(DropReason::Deleted) => "dropped_deleted",
            Outcome::Dropped(DropReason::InvalidKey) => "dropped_invalid_key",
        }
    }
}

/// Failed pass. Every variant is retried with backoff.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("error getting {kind} {key}: {source}")]
    Store {
        kind: &'static str,
        key: ObjectKey,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error("couldn't create deployment {key}: {source}")]
    Create {
        key: ObjectKey,
        #[source]
        source: ClientError,
    },
    #[error("couldn't update status of cat {key}: {source}")]
    StatusUpdate {
        key: ObjectKey,
        #[source]
        source: ClientError,
    },
    #[error("reconcile panicked: {0}")]
    Panicked(String),
}

impl ReconcileError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileError::Store { .. } => "store",
            ReconcileError::Validation(_) => "validation",
            ReconcileError::Conflict(_) => "conflict",
            ReconcileError::Create { .. } => "create",
            ReconcileError::StatusUpdate { .. } => "status_update",
            ReconcileError::Panicked(_) => "panicked",
        }
    }
}

pub struct Reconciler {
    cats: Arc<dyn Lister<Cat>>,
    deployments: Arc<dyn Lister<Deployment>>,
    creator: Arc<dyn DeploymentCreator>,
    status: Arc<dyn CatStatusUpdater>,
    recorder: Arc<dyn EventRecorder>,
}

impl Reconciler {
    pub fn new(
        cats: Arc<dyn Lister<Cat>>,
        deployments: Arc<dyn Lister<Deployment>>,
        creator: Arc<dyn DeploymentCreator>,
        status: Arc<dyn CatStatusUpdater>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self { cats, deployments, creator, status, recorder }
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
        let Some(namespace) = key.namespace.as_deref() else {
            error!(key = %key, "invalid resource key: cats are namespaced");
            return Ok(Outcome::Dropped(DropReason::InvalidKey));
        };

        let cat = match self.cats.get(Some(namespace), &key.name) {
            Ok(Some(cat)) => cat,
            Ok(None) => {
                debug!(key = %key, "cat no longer exists; dropping");
                return Ok(Outcome::Dropped(DropReason::Deleted));
            }
            Err(source) => return Err(ReconcileError::Store { kind: "cat", key: key.clone(), source }),
        };

        if let Err(e) = validate_cat(&cat) {
            self.event(&cat, EventType::Warning, ERR_INVALID, &e.to_string());
            return Err(e.into());
        }

        let name = deployment_name(&cat);
        let existing = self.deployments.get(Some(namespace), &name).map_err(|source| ReconcileError::Store {
            kind: "deployment",
            key: ObjectKey::namespaced(namespace, &name),
            source,
        })?;

        let reason = match existing {
            Some(deployment) => {
                if let Err(e) = validate_deployment(&deployment, &cat) {
                    self.event(&cat, EventType::Warning, ERR_RESOURCE_EXISTS, &e.to_string());
                    return Err(e.into());
                }
                REASON_DEPLOYMENT_READY
            }
            None => {
                let desired = desired_deployment(&cat);
                self.creator.create(&desired).await.map_err(|source| ReconcileError::Create {
                    key: ObjectKey::namespaced(namespace, &name),
                    source,
                })?;
                info!(key = %key, deployment = %name, "created deployment");
                REASON_DEPLOYMENT_CREATED
            }
        };

        self.update_status(&cat, &name, reason).await?;
        self.event(&cat, EventType::Normal, SUCCESS_SYNCED, MESSAGE_RESOURCE_SYNCED);
        Ok(Outcome::Synced)
    }

    async fn update_status(&self, cat: &Cat, deployment: &str, reason: &str) -> Result<(), ReconcileError> {
        // never modify objects from the cache
        let mut next = cat.clone();
        let mut status = next.status_or_default();
        status.set_condition(CatCondition {
            type_: CatConditionType::Ready,
            status: ConditionStatus::True,
            last_transition_time: Utc::now(),
            reason: Some(reason.to_string()),
            message: Some(format!("Deployment {deployment:?} is controlled by this Cat")),
        });
        next.status = Some(status);
        self.status
            .update_status(&next)
            .await
            .map_err(|source| ReconcileError::StatusUpdate { key: ObjectKey::from_resource(cat), source })
    }

    fn event(&self, cat: &Cat, type_: EventType, reason: &str, message: &str) {
        self.recorder.emit(&cat.object_ref(&()), type_, reason, message);
    }
}
