//! Tabby core types: the Cat resource, object keys, ownership and validation.

#![forbid(unsafe_code)]

pub mod cat;
pub mod deployment;
pub mod key;
pub mod owner;
pub mod validation;

pub use cat::{Breed, Cat, CatCondition, CatConditionType, CatSpec, CatStatus, ConditionStatus};
pub use key::{KeyError, ObjectKey};
pub use validation::{validate_cat, validate_deployment, ConflictError, ValidationError};

/// Name used as the event source and field manager.
pub const CONTROLLER_NAME: &str = "cat-controller";

pub mod prelude {
    pub use super::cat::{Breed, Cat, CatCondition, CatConditionType, CatSpec, CatStatus, ConditionStatus};
    pub use super::key::ObjectKey;
    pub use super::owner::{controller_of, is_cat_ref, is_controlled_by};
}
