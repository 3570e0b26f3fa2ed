//! Desired Deployment for a Cat.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use crate::cat::Cat;
use crate::owner::cat_controller_ref;

pub const DEFAULT_IMAGE: &str = "nginx:latest";
pub const CONTAINER_NAME: &str = "nginx";
pub const CAT_LABEL: &str = "tabby.dev/cat";

/// Name of the Deployment a Cat owns. Same as the Cat's object name.
pub fn deployment_name(cat: &Cat) -> String {
    cat.name_any()
}

fn labels(cat: &Cat) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), CONTAINER_NAME.to_string()),
        (CAT_LABEL.to_string(), cat.name_any()),
    ])
}

/// Deployment that should exist for `cat`, controller reference attached.
pub fn desired_deployment(cat: &Cat) -> Deployment {
    let labels = labels(cat);
    Deployment {
        metadata: ObjectMeta {
            name: Some(deployment_name(cat)),
            namespace: cat.namespace(),
            owner_references: Some(vec![cat_controller_ref(cat)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: CONTAINER_NAME.to_string(),
                        image: Some(DEFAULT_IMAGE.to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
