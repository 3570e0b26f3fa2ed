//! Guard clauses for Cats and the Deployments they own.

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;

use crate::cat::Cat;
use crate::key::ObjectKey;
use crate::owner::is_controlled_by;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("cat {0} does not have required field spec.name")]
    MissingName(ObjectKey),
}

/// A same-named Deployment exists but is controlled by someone else.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Resource {deployment:?} already exists and is not managed by Cat {owner:?}")]
pub struct ConflictError {
    pub deployment: String,
    pub owner: String,
}

pub fn validate_cat(cat: &Cat) -> Result<(), ValidationError> {
    if cat.spec.name.is_empty() {
        return Err(ValidationError::MissingName(ObjectKey::from_resource(cat)));
    }
    Ok(())
}

pub fn validate_deployment(deployment: &Deployment, cat: &Cat) -> Result<(), ConflictError> {
    if !is_controlled_by(deployment, cat) {
        return Err(ConflictError {
            deployment: deployment.name_any(),
            owner: ObjectKey::from_resource(cat).to_string(),
        });
    }
    Ok(())
}
