//! Owner index: which Cat, if any, controls a managed object.
//!
//! Owner references are treated as lookup tuples (kind, name, uid) only.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use crate::cat::Cat;

/// The controlling owner reference of `obj`, if any.
pub fn controller_of<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.meta()
        .owner_references
        .as_deref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

fn api_group(api_version: &str) -> &str {
    match api_version.split_once('/') {
        Some((group, _)) => group,
        None => "",
    }
}

/// True when the reference points at a `tabby.dev` Cat (any version).
pub fn is_cat_ref(r: &OwnerReference) -> bool {
    r.kind == Cat::kind(&()) && api_group(&r.api_version) == Cat::group(&())
}

/// True when `obj` is controlled by exactly this Cat. UIDs are compared when
/// the Cat has one, which is always the case for objects read from a cluster.
pub fn is_controlled_by<K: Resource>(obj: &K, cat: &Cat) -> bool {
    let Some(r) = controller_of(obj) else { return false };
    if !is_cat_ref(r) || r.name != cat.name_any() {
        return false;
    }
    match cat.uid() {
        Some(uid) => r.uid == uid,
        None => true,
    }
}

/// Controller reference pointing at `cat`, suitable for objects it creates.
pub fn cat_controller_ref(cat: &Cat) -> OwnerReference {
    OwnerReference {
        api_version: Cat::api_version(&()).to_string(),
        kind: Cat::kind(&()).to_string(),
        name: cat.name_any(),
        uid: cat.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}
