//! Tabby kubehub: kube-rs glue for the controller.
//!
//! List+watch streams feed the in-memory stores; the collaborator traits of
//! `tabby-controller` are implemented over the API server.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use anyhow::Result;
use futures::TryStreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    api::{Api, PostParams},
    runtime::{
        events::{Event as KubeEvent, EventType as KubeEventType, Recorder, Reporter},
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Resource, ResourceExt,
};
use metrics::counter;
use serde::de::DeserializeOwned;
use tabby_controller::{CatStatusUpdater, ClientError, DeploymentCreator, EventRecorder, EventType};
use tabby_core::{Cat, CONTROLLER_NAME};
use tabby_store::Store;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Client from kubeconfig or the in-cluster environment.
pub async fn client() -> Result<Client> {
    Ok(Client::try_default().await?)
}

/// `Api` for `K`, scoped to `namespace` when given.
pub fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Mirror `api` into `store` until the watch stream ends. Transient watch
/// errors are retried with the watcher's default backoff.
pub async fn reflect<K>(api: Api<K>, store: Store<K>) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let kind = store.kind().to_string();
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %kind, "watcher started");
    loop {
        match stream.try_next().await {
            Ok(Some(Event::Applied(obj))) => store.apply(obj),
            Ok(Some(Event::Deleted(obj))) => store.delete(obj),
            Ok(Some(Event::Restarted(list))) => {
                debug!(kind = %kind, count = list.len(), "watch restart");
                store.replace(list);
            }
            Ok(None) => break,
            Err(e) => {
                counter!("watch_errors_total", 1u64, "kind" => kind.clone());
                warn!(kind = %kind, error = %e, "watch error");
            }
        }
    }
    warn!(kind = %kind, "watcher stream ended");
    Ok(())
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 409)
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404)
}

/// Creates Deployments through the API server.
pub struct KubeDeployments {
    client: Client,
}

impl KubeDeployments {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl DeploymentCreator for KubeDeployments {
    async fn create(&self, deployment: &Deployment) -> Result<(), ClientError> {
        let ns = deployment.namespace().unwrap_or_default();
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &ns);
        match api.create(&PostParams::default(), deployment).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => Err(ClientError::AlreadyExists(deployment.name_any())),
            Err(e) => Err(ClientError::Api(e.to_string())),
        }
    }
}

/// Writes the Cat status subresource. The write carries the cached
/// resourceVersion, so a stale copy fails with `Conflict`.
pub struct KubeCats {
    client: Client,
}

impl KubeCats {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl CatStatusUpdater for KubeCats {
    async fn update_status(&self, cat: &Cat) -> Result<(), ClientError> {
        let ns = cat.namespace().unwrap_or_default();
        let name = cat.name_any();
        let api: Api<Cat> = Api::namespaced(self.client.clone(), &ns);
        let body = serde_json::to_vec(cat).map_err(|e| ClientError::Api(e.to_string()))?;
        match api.replace_status(&name, &PostParams::default(), body).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => Err(ClientError::Conflict(e.to_string())),
            Err(e) if is_not_found(&e) => Err(ClientError::NotFound(format!("{ns}/{name}"))),
            Err(e) => Err(ClientError::Api(e.to_string())),
        }
    }
}

/// Publishes Kubernetes Events in the background; callers never wait on
/// the API server.
pub struct KubeRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeRecorder {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter { controller: CONTROLLER_NAME.to_string(), instance: Some(Uuid::new_v4().to_string()) };
        Self { client, reporter }
    }
}

impl EventRecorder for KubeRecorder {
    fn emit(&self, subject: &ObjectReference, type_: EventType, reason: &str, message: &str) {
        match type_ {
            EventType::Normal => info!(object = ?subject.name, reason, message, "event"),
            EventType::Warning => warn!(object = ?subject.name, reason, message, "event"),
        }
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), subject.clone());
        let event = KubeEvent {
            type_: match type_ {
                EventType::Normal => KubeEventType::Normal,
                EventType::Warning => KubeEventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        tokio::spawn(async move {
            if let Err(e) = recorder.publish(event).await {
                warn!(error = %e, "failed to publish event");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} for test"),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn api_status_codes_are_classified() {
        assert!(is_conflict(&api_error(409, "AlreadyExists")));
        assert!(!is_conflict(&api_error(404, "NotFound")));
        assert!(is_not_found(&api_error(404, "NotFound")));
        assert!(!is_not_found(&api_error(500, "InternalError")));
    }
}
