use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A user-supplied policy definition. Installing a template makes a new
/// constraint kind available under the `constraints.gatekeeper.sh` group.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "templates.gatekeeper.sh",
    version = "v1beta1",
    kind = "ConstraintTemplate",
    status = "ConstraintTemplateStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintTemplateSpec {
    pub crd: TemplateCrd,
    #[serde(default)]
    pub targets: Vec<Target>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateCrd {
    pub spec: TemplateCrdSpec,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateCrdSpec {
    pub names: CrdNames,
    pub validation: Option<Validation>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CrdNames {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_names: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    /// The OpenAPI v3 schema constraining the `spec.parameters` field of
    /// instances of the installed kind.
    #[serde(rename = "openAPIV3Schema", skip_serializing_if = "Option::is_none")]
    pub open_apiv3_schema: Option<serde_json::Value>,
}

/// Pairs a target identifier with a policy program and optional libraries.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub target: String,
    pub rego: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub libs: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintTemplateStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<CreateError>>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl ConstraintTemplate {
    /// The kind this template installs, as declared in the embedded CRD.
    pub fn declared_kind(&self) -> &str {
        &self.spec.crd.spec.names.kind
    }
}
