use crate::{
    core::{Engine, EnforcementAction, Template},
    k8s::{self, ConstraintTemplate, ResourceExt},
};
use kube::core::admission::AdmissionRequest;
use kube::core::DynamicObject;
use thiserror::Error;

/// A rejected policy resource. User errors carry HTTP 422; anything else is
/// an internal failure and carries HTTP 500.
#[derive(Debug, Error)]
pub(crate) enum ValidationError {
    #[error("{0}")]
    User(String),

    #[error("{0}")]
    Internal(String),
}

impl ValidationError {
    pub(crate) fn code(&self) -> u16 {
        match self {
            ValidationError::User(_) => 422,
            ValidationError::Internal(_) => 500,
        }
    }
}

/// Pre-validates create/update requests for this system's own resources, so
/// broken policies are rejected before they are persisted.
pub(crate) async fn validate_policy_resource(
    engine: &dyn Engine,
    req: &AdmissionRequest<DynamicObject>,
    disable_enforcement_action_validation: bool,
) -> Result<(), ValidationError> {
    if req.kind.group == k8s::TEMPLATE_GROUP && req.kind.kind == "ConstraintTemplate" {
        return validate_template(engine, req).await;
    }
    if req.kind.group == k8s::CONSTRAINT_GROUP {
        return validate_constraint(engine, req, disable_enforcement_action_validation).await;
    }
    if req.kind.group == k8s::CONFIG_GROUP && req.kind.kind == "Config" {
        return validate_config(req);
    }
    Ok(())
}

async fn validate_template(
    engine: &dyn Engine,
    req: &AdmissionRequest<DynamicObject>,
) -> Result<(), ValidationError> {
    let obj = request_object(req)?;
    let tmpl: ConstraintTemplate = serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|e| ValidationError::User(e.to_string()))?;
    let template = Template::try_from(&tmpl).map_err(|e| ValidationError::User(e.to_string()))?;

    // A dry install surfaces compile and schema problems without mutating
    // the engine.
    engine.create_crd(&template).await.map_err(|e| {
        if e.is_user_error() {
            ValidationError::User(e.to_string())
        } else {
            ValidationError::Internal(e.to_string())
        }
    })
}

async fn validate_constraint(
    engine: &dyn Engine,
    req: &AdmissionRequest<DynamicObject>,
    disable_enforcement_action_validation: bool,
) -> Result<(), ValidationError> {
    let obj = request_object(req)?;
    engine.validate_constraint(obj).await.map_err(|e| {
        if e.is_user_error() {
            ValidationError::User(e.to_string())
        } else {
            ValidationError::Internal(e.to_string())
        }
    })?;

    let action = obj
        .data
        .pointer("/spec/enforcementAction")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if !action.is_empty() && !disable_enforcement_action_validation {
        let action: EnforcementAction = match action.parse() {
            Ok(action) => action,
            Err(infallible) => match infallible {},
        };
        action
            .validate()
            .map_err(|e| ValidationError::User(e.to_string()))?;
    }
    Ok(())
}

fn validate_config(req: &AdmissionRequest<DynamicObject>) -> Result<(), ValidationError> {
    let obj = request_object(req)?;
    let name = obj.name_any();
    if name != k8s::CONFIG_NAME {
        return Err(ValidationError::User(format!(
            "config resource must be named {}, got {name}",
            k8s::CONFIG_NAME,
        )));
    }
    Ok(())
}

fn request_object(
    req: &AdmissionRequest<DynamicObject>,
) -> Result<&DynamicObject, ValidationError> {
    req.object
        .as_ref()
        .ok_or_else(|| ValidationError::Internal("admission request missing 'object'".to_string()))
}
