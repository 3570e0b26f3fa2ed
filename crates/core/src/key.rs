//! Reconcile keys.

use std::fmt;
use std::str::FromStr;

use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};

/// Identity of an object in the cache: `(namespace, name)`.
///
/// This is the only item the work queue ever carries. Namespaced objects
/// render as `namespace/name`, cluster-scoped ones as `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    /// Key of a resource as seen in its metadata.
    pub fn from_resource<K: Resource>(obj: &K) -> Self {
        Self { namespace: obj.namespace(), name: obj.name_any() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("unexpected key format: {0:?}")]
    Format(String),
    #[error("key has empty name: {0:?}")]
    EmptyName(String),
}

impl FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let (namespace, name) = match parts.as_slice() {
            [name] => (None, *name),
            [ns, name] => (Some(*ns), *name),
            _ => return Err(KeyError::Format(s.to_string())),
        };
        if name.is_empty() {
            return Err(KeyError::EmptyName(s.to_string()));
        }
        Ok(Self::new(namespace.filter(|ns| !ns.is_empty()), name))
    }
}
