//! In-memory collaborators for tests.
//!
//! Every fake records its calls. The client fakes can mirror writes into a
//! [`Store`] so a running controller observes its own mutations the way it
//! would through a watch.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use parking_lot::Mutex;
use tabby_core::deployment::desired_deployment;
use tabby_core::{Cat, CatSpec, ObjectKey};
use tabby_store::{HasSynced, Lister, Store, StoreError};

use crate::client::{CatStatusUpdater, ClientError, DeploymentCreator, EventRecorder, EventType};
use crate::controller::{Controller, ControllerConfig};
use crate::reconciler::Reconciler;

/// resourceVersion of every fixture object.
pub const FIXTURE_RESOURCE_VERSION: &str = "1";

/// Server-side resourceVersion counter. Clones share the counter; versions
/// it hands out are always newer than [`FIXTURE_RESOURCE_VERSION`].
#[derive(Clone, Default)]
pub struct ResourceVersions(Arc<AtomicU64>);

impl ResourceVersions {
    pub fn next(&self) -> String {
        (self.0.fetch_add(1, Ordering::SeqCst) + 2).to_string()
    }
}

/// Namespaced Cat with a uid and resourceVersion, as read from a cluster.
pub fn cat(namespace: &str, name: &str, spec_name: &str) -> Cat {
    let mut c = Cat::new(name, CatSpec { name: spec_name.to_string(), ..Default::default() });
    c.metadata.namespace = Some(namespace.to_string());
    c.metadata.uid = Some(format!("uid-{namespace}-{name}"));
    c.metadata.resource_version = Some(FIXTURE_RESOURCE_VERSION.to_string());
    c
}

/// Deployment the controller would have created for `cat`.
pub fn owned_deployment(cat: &Cat) -> Deployment {
    let mut d = desired_deployment(cat);
    d.metadata.uid = Some(format!("uid-deploy-{}", cat.name_any()));
    d.metadata.resource_version = Some(FIXTURE_RESOURCE_VERSION.to_string());
    d
}

/// Deployment with no controller, e.g. created by hand.
pub fn foreign_deployment(namespace: &str, name: &str) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-foreign-{name}")),
            resource_version: Some(FIXTURE_RESOURCE_VERSION.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Lister whose every read fails.
pub struct FailingLister;

impl<K> Lister<K> for FailingLister {
    fn get(&self, _namespace: Option<&str>, name: &str) -> Result<Option<Arc<K>>, StoreError> {
        Err(StoreError::Unavailable(format!("lister down while reading {name}")))
    }
}

#[derive(Default)]
pub struct FakeDeploymentClient {
    mirror: Option<(Store<Deployment>, ResourceVersions)>,
    created: Mutex<Vec<Deployment>>,
    fail: Mutex<Option<ClientError>>,
    panic_next: AtomicBool,
    calls: AtomicUsize,
}

impl FakeDeploymentClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Created objects are applied to `store` with a server-assigned
    /// resourceVersion. Creating a name already in the store fails with
    /// `AlreadyExists`.
    pub fn mirroring(store: Store<Deployment>, versions: ResourceVersions) -> Self {
        Self { mirror: Some((store, versions)), ..Self::default() }
    }

    /// Fail every following call with `err` (`None` to recover).
    pub fn fail_with(&self, err: Option<ClientError>) {
        *self.fail.lock() = err;
    }

    /// Panic inside the next call.
    pub fn panic_once(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    /// Successful creates, in call order.
    pub fn created(&self) -> Vec<Deployment> {
        self.created.lock().clone()
    }

    /// All calls, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DeploymentCreator for FakeDeploymentClient {
    async fn create(&self, deployment: &Deployment) -> Result<(), ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("injected create panic");
        }
        if let Some(err) = self.fail.lock().clone() {
            return Err(err);
        }
        let mut obj = deployment.clone();
        if let Some((store, versions)) = &self.mirror {
            if store.get(&ObjectKey::from_resource(&obj)).is_some() {
                return Err(ClientError::AlreadyExists(obj.name_any()));
            }
            obj.metadata.uid = Some(format!("uid-deploy-{}", obj.name_any()));
            obj.metadata.resource_version = Some(versions.next());
            store.apply(obj.clone());
        }
        self.created.lock().push(obj);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCatClient {
    mirror: Option<(Store<Cat>, ResourceVersions)>,
    updates: Mutex<Vec<Cat>>,
    fail: Mutex<Option<ClientError>>,
    calls: AtomicUsize,
}

impl FakeCatClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status writes are applied to `store`, but only when they change the
    /// stored status: an unchanged write produces no watch event on a real
    /// server either.
    pub fn mirroring(store: Store<Cat>, versions: ResourceVersions) -> Self {
        Self { mirror: Some((store, versions)), ..Self::default() }
    }

    pub fn fail_with(&self, err: Option<ClientError>) {
        *self.fail.lock() = err;
    }

    /// Successful status writes, in call order.
    pub fn updates(&self) -> Vec<Cat> {
        self.updates.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CatStatusUpdater for FakeCatClient {
    async fn update_status(&self, cat: &Cat) -> Result<(), ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail.lock().clone() {
            return Err(err);
        }
        if let Some((store, versions)) = &self.mirror {
            let key = ObjectKey::from_resource(cat);
            let Some(current) = store.get(&key) else {
                return Err(ClientError::NotFound(key.to_string()));
            };
            if current.status != cat.status {
                let mut next = Cat::clone(&current);
                next.status = cat.status.clone();
                next.metadata.resource_version = Some(versions.next());
                store.apply(next);
            }
        }
        self.updates.lock().push(cat.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub subject: ObjectKey,
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
pub struct FakeRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl FakeRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }
}

impl EventRecorder for FakeRecorder {
    fn emit(&self, subject: &ObjectReference, type_: EventType, reason: &str, message: &str) {
        self.events.lock().push(RecordedEvent {
            subject: ObjectKey::new(subject.namespace.as_deref(), subject.name.as_deref().unwrap_or_default()),
            type_,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

/// Two caches plus mirroring fakes wired the way the binary wires the real
/// clients.
pub struct Harness {
    pub cats: Store<Cat>,
    pub deployments: Store<Deployment>,
    pub deployment_client: Arc<FakeDeploymentClient>,
    pub cat_client: Arc<FakeCatClient>,
    pub recorder: Arc<FakeRecorder>,
    pub versions: ResourceVersions,
}

impl Harness {
    /// Both caches already synced.
    pub fn new() -> Self {
        let h = Self::unsynced();
        h.cats.mark_synced();
        h.deployments.mark_synced();
        h
    }

    pub fn unsynced() -> Self {
        let cats = Store::new("Cat");
        let deployments = Store::new("Deployment");
        let versions = ResourceVersions::default();
        Self {
            deployment_client: Arc::new(FakeDeploymentClient::mirroring(
                deployments.clone(),
                versions.clone(),
            )),
            cat_client: Arc::new(FakeCatClient::mirroring(cats.clone(), versions.clone())),
            recorder: Arc::new(FakeRecorder::new()),
            cats,
            deployments,
            versions,
        }
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::new(self.cats.clone()),
            Arc::new(self.deployments.clone()),
            self.deployment_client.clone(),
            self.cat_client.clone(),
            self.recorder.clone(),
        )
    }

    pub fn controller(&self, config: ControllerConfig) -> Controller {
        let caches: Vec<Arc<dyn HasSynced>> = vec![Arc::new(self.cats.clone()), Arc::new(self.deployments.clone())];
        Controller::new(self.reconciler(), caches, config)
    }

    /// Mutating calls made so far, failed ones included.
    pub fn mutations(&self) -> usize {
        self.deployment_client.calls() + self.cat_client.calls()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mirrored_writes_get_fresh_resource_versions() {
        let h = Harness::new();
        h.cats.apply(cat("ns1", "billie", "billie"));
        let c = h.cats.get(&ObjectKey::namespaced("ns1", "billie")).unwrap();
        h.deployment_client.create(&desired_deployment(&c)).await.unwrap();

        let d = h.deployments.get(&ObjectKey::namespaced("ns1", "billie")).unwrap();
        assert_eq!(d.resource_version().as_deref(), Some("2"));
        // a second harness starts from its own counter
        assert_eq!(Harness::new().versions.next(), "2");
        assert_eq!(h.versions.next(), "3");
    }
}
