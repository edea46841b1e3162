#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod gvk;
pub mod labels;
pub mod template;

pub use self::{
    config::Config,
    gvk::GroupVersionKind,
    template::{ConstraintTemplate, ConstraintTemplateStatus},
};
pub use k8s_openapi::api::core::v1::{Namespace, ObjectReference, Secret};
pub use k8s_openapi::ByteString;
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    core::{ApiResource, DynamicObject},
    Client, Resource,
};

/// The API group under which dynamically installed constraint kinds live.
pub const CONSTRAINT_GROUP: &str = "constraints.gatekeeper.sh";

/// The API version used for dynamically installed constraint kinds.
pub const CONSTRAINT_VERSION: &str = "v1beta1";

/// The API group of `ConstraintTemplate` resources.
pub const TEMPLATE_GROUP: &str = "templates.gatekeeper.sh";

/// The API group of the `Config` resource.
pub const CONFIG_GROUP: &str = "config.gatekeeper.sh";

/// The well-known name of the singleton `Config` resource.
pub const CONFIG_NAME: &str = "config";

/// Returns the kind identifier of the constraint kind installed by a
/// template declaring `kind`.
pub fn constraint_gvk(kind: &str) -> GroupVersionKind {
    GroupVersionKind::new(CONSTRAINT_GROUP, CONSTRAINT_VERSION, kind)
}
