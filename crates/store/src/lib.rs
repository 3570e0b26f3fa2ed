//! Tabby store: eventually consistent, read-only local mirror of one
//! resource kind, keyed by namespace/name.
//!
//! Readers get `Arc` snapshots of cached objects and must copy before
//! modifying. Writers (the watcher glue) apply changes one at a time; every
//! change is pushed to subscribers as a [`StoreEvent`] in apply order.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use kube::Resource;
use metrics::gauge;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tabby_core::ObjectKey;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Change notification delivered to subscribers.
#[derive(Debug)]
pub enum StoreEvent<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    /// `final_state_unknown` is set when the object was found missing on a
    /// relist; `obj` is then the last state the cache knew about.
    Deleted { obj: Arc<K>, final_state_unknown: bool },
}

impl<K> Clone for StoreEvent<K> {
    fn clone(&self) -> Self {
        match self {
            Self::Added(obj) => Self::Added(Arc::clone(obj)),
            Self::Updated { old, new } => Self::Updated { old: Arc::clone(old), new: Arc::clone(new) },
            Self::Deleted { obj, final_state_unknown } => {
                Self::Deleted { obj: Arc::clone(obj), final_state_unknown: *final_state_unknown }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Read access to cached objects. `Ok(None)` means not found.
pub trait Lister<K>: Send + Sync {
    fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<Arc<K>>, StoreError>;
}

/// Initial-sync readiness of a cache.
#[async_trait::async_trait]
pub trait HasSynced: Send + Sync {
    fn has_synced(&self) -> bool;
    /// Resolves once the first full listing has been applied.
    async fn wait_synced(&self);
}

type Objects<K> = FxHashMap<ObjectKey, Arc<K>>;

struct Inner<K> {
    kind: String,
    objects: ArcSwap<Objects<K>>,
    /// Held by writers for the whole apply+notify step so subscribers see
    /// changes in the same order they were applied.
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StoreEvent<K>>>>,
    synced: watch::Sender<bool>,
}

/// Local cache for one kind. Clones share the same cache.
pub struct Store<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K> Store<K>
where
    K: Resource + Send + Sync + 'static,
{
    pub fn new(kind: impl Into<String>) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                kind: kind.into(),
                objects: ArcSwap::from_pointee(FxHashMap::default()),
                subscribers: Mutex::new(Vec::new()),
                synced,
            }),
        }
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    /// Register for change notifications. Only changes applied after this
    /// call are delivered.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent<K>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.inner.objects.load().get(key).cloned()
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.inner.objects.load().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.objects.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace an object (watch `Applied`).
    pub fn apply(&self, obj: K) {
        let key = ObjectKey::from_resource(&obj);
        let new = Arc::new(obj);
        let mut subs = self.inner.subscribers.lock();
        let mut next = Objects::clone(&self.inner.objects.load());
        let event = match next.insert(key, Arc::clone(&new)) {
            Some(old) => StoreEvent::Updated { old, new },
            None => StoreEvent::Added(new),
        };
        self.swap(next);
        Self::notify(&mut subs, event);
    }

    /// Remove an object (watch `Deleted`).
    pub fn delete(&self, obj: K) {
        let key = ObjectKey::from_resource(&obj);
        let mut subs = self.inner.subscribers.lock();
        let mut next = Objects::clone(&self.inner.objects.load());
        next.remove(&key);
        self.swap(next);
        Self::notify(&mut subs, StoreEvent::Deleted { obj: Arc::new(obj), final_state_unknown: false });
    }

    /// Replace the whole content with a fresh listing (watch `Restarted`).
    /// Objects missing from the listing are reported deleted with an unknown
    /// final state. Marks the store synced.
    pub fn replace(&self, list: Vec<K>) {
        let mut subs = self.inner.subscribers.lock();
        let mut prev = Objects::clone(&self.inner.objects.load());
        let mut next = Objects::default();
        let mut events = Vec::with_capacity(list.len());
        for obj in list {
            let key = ObjectKey::from_resource(&obj);
            let new = Arc::new(obj);
            events.push(match prev.remove(&key) {
                Some(old) => StoreEvent::Updated { old, new: Arc::clone(&new) },
                None => StoreEvent::Added(Arc::clone(&new)),
            });
            next.insert(key, new);
        }
        let removed = prev.len();
        for (_, obj) in prev {
            events.push(StoreEvent::Deleted { obj, final_state_unknown: true });
        }
        debug!(kind = %self.inner.kind, count = next.len(), removed, "store relisted");
        self.swap(next);
        for ev in events {
            Self::notify(&mut subs, ev);
        }
        drop(subs);
        self.mark_synced();
    }

    /// Flag the initial listing as applied.
    pub fn mark_synced(&self) {
        let was = self.inner.synced.send_replace(true);
        if !was {
            info!(kind = %self.inner.kind, objects = self.len(), "cache synced");
        }
    }

    fn swap(&self, next: Objects<K>) {
        gauge!("store_objects", next.len() as f64, "kind" => self.inner.kind.clone());
        self.inner.objects.store(Arc::new(next));
    }

    fn notify(subs: &mut Vec<mpsc::UnboundedSender<StoreEvent<K>>>, event: StoreEvent<K>) {
        match subs.as_slice() {
            [] => {}
            [only] => {
                if only.send(event).is_err() {
                    subs.clear();
                }
            }
            _ => subs.retain(|tx| tx.send(event.clone()).is_ok()),
        }
    }
}

impl<K> Lister<K> for Store<K>
where
    K: Resource + Send + Sync + 'static,
{
    fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<Arc<K>>, StoreError> {
        Ok(Store::get(self, &ObjectKey::new(namespace, name)))
    }
}

#[async_trait::async_trait]
impl<K> HasSynced for Store<K>
where
    K: Resource + Send + Sync + 'static,
{
    fn has_synced(&self) -> bool {
        *self.inner.synced.borrow()
    }

    async fn wait_synced(&self) {
        let mut rx = self.inner.synced.subscribe();
        let _ = rx.wait_for(|synced| *synced).await;
    }
}
