use crate::review::{Responses, ReviewOptions, ReviewRequest};
use gatekeeper_policy_controller_k8s_api as k8s;
use k8s::{template, ConstraintTemplate, DynamicObject, ResourceExt};
use thiserror::Error;

/// The decision engine's internal form of a constraint template.
#[derive(Clone, Debug, PartialEq)]
pub struct Template {
    pub name: String,
    /// The constraint kind this template installs.
    pub kind: String,
    /// The OpenAPI v3 schema for the installed kind's parameters.
    pub schema: Option<serde_json::Value>,
    pub targets: Vec<Target>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub target: String,
    pub rego: String,
    pub libs: Vec<String>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// The submitted policy source is at fault: bad template source, a
    /// malformed constraint, an unknown kind. Surfaced to the user.
    #[error("invalid policy: {0}")]
    BadPolicy(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn is_user_error(&self) -> bool {
        matches!(self, EngineError::BadPolicy(_))
    }
}

/// The opaque policy evaluator.
///
/// Implementations are expected to be internally thread-safe; callers do
/// not serialize `review` or `add_constraint` calls.
#[async_trait::async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Registers a template, installing its constraint kind.
    async fn add_template(&self, template: &Template) -> Result<(), EngineError>;

    /// Removes a template and all constraints of its kind.
    async fn remove_template(&self, template: &Template) -> Result<(), EngineError>;

    /// Dry-installs a template's CRD without registering it. Used to
    /// validate templates at admission time.
    async fn create_crd(&self, template: &Template) -> Result<(), EngineError>;

    async fn add_constraint(&self, constraint: &DynamicObject) -> Result<(), EngineError>;

    async fn remove_constraint(&self, constraint: &DynamicObject) -> Result<(), EngineError>;

    /// Checks a constraint against its kind's installed schema.
    async fn validate_constraint(&self, constraint: &DynamicObject) -> Result<(), EngineError>;

    /// Mirrors an object into the engine's data space.
    async fn add_data(&self, object: &DynamicObject) -> Result<(), EngineError>;

    async fn remove_data(&self, object: &DynamicObject) -> Result<(), EngineError>;

    /// Evaluates an admission request against all registered constraints.
    async fn review(
        &self,
        request: ReviewRequest,
        options: ReviewOptions,
    ) -> Result<Responses, EngineError>;

    /// Serializes the engine's state for diagnostics.
    async fn dump(&self) -> Result<String, EngineError>;
}

#[derive(Debug, Error)]
pub enum TemplateConvertError {
    #[error("template declares no constraint kind")]
    MissingKind,
}

impl TryFrom<&ConstraintTemplate> for Template {
    type Error = TemplateConvertError;

    fn try_from(tmpl: &ConstraintTemplate) -> Result<Self, Self::Error> {
        let kind = tmpl.declared_kind().to_string();
        if kind.is_empty() {
            return Err(TemplateConvertError::MissingKind);
        }
        Ok(Template {
            name: tmpl.name_any(),
            kind,
            schema: tmpl
                .spec
                .crd
                .spec
                .validation
                .as_ref()
                .and_then(|v| v.open_apiv3_schema.clone()),
            targets: tmpl.spec.targets.iter().map(Target::from).collect(),
        })
    }
}

impl From<&template::Target> for Target {
    fn from(t: &template::Target) -> Self {
        Self {
            target: t.target.clone(),
            rego: t.rego.clone(),
            libs: t.libs.clone(),
        }
    }
}
