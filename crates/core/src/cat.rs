//! `Cat` custom resource (`tabby.dev/v1alpha1`).

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of a Cat. The controller never writes the spec.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "tabby.dev", version = "v1alpha1", kind = "Cat", namespaced)]
#[kube(status = "CatStatus", shortname = "cat", derive = "PartialEq")]
pub struct CatSpec {
    /// Display name; required and non-empty.
    pub name: String,
    #[serde(default)]
    pub phrase: String,
    #[serde(default)]
    pub breed: Breed,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum Breed {
    #[default]
    Moggie,
    MaineCoone,
    Persian,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum CatConditionType {
    Nap,
    Hungry,
    /// The owned Deployment exists and is controlled by this Cat.
    Ready,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CatCondition {
    #[serde(rename = "type")]
    pub type_: CatConditionType,
    pub status: ConditionStatus,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CatStatus {
    #[serde(default)]
    pub conditions: Vec<CatCondition>,
}

impl CatStatus {
    pub fn condition(&self, type_: CatConditionType) -> Option<&CatCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Insert or replace the condition of the same type. The previous
    /// `lastTransitionTime` survives when the status value did not change.
    pub fn set_condition(&mut self, mut next: CatCondition) {
        match self.conditions.iter_mut().find(|c| c.type_ == next.type_) {
            Some(cur) => {
                if cur.status == next.status {
                    next.last_transition_time = cur.last_transition_time;
                }
                *cur = next;
            }
            None => self.conditions.push(next),
        }
    }
}

impl Cat {
    /// Status with an empty default when the object has none yet.
    pub fn status_or_default(&self) -> CatStatus {
        self.status.clone().unwrap_or_default()
    }
}
