//! Narrow contracts to the collaborators that mutate cluster state.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ObjectReference;
use tabby_core::Cat;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Optimistic concurrency failure (stale resourceVersion).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("api: {0}")]
    Api(String),
}

#[async_trait::async_trait]
pub trait DeploymentCreator: Send + Sync {
    async fn create(&self, deployment: &Deployment) -> Result<(), ClientError>;
}

#[async_trait::async_trait]
pub trait CatStatusUpdater: Send + Sync {
    /// Persist `cat.status`. The spec is ignored by the server.
    async fn update_status(&self, cat: &Cat) -> Result<(), ClientError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Fire-and-forget event sink. Must not block the caller.
pub trait EventRecorder: Send + Sync {
    fn emit(&self, subject: &ObjectReference, type_: EventType, reason: &str, message: &str);
}
