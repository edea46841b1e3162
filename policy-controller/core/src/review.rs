use gatekeeper_policy_controller_k8s_api::{DynamicObject, Namespace};
use kube::core::admission::AdmissionRequest;
use std::{fmt, str::FromStr};
use thiserror::Error;

/// An admission request augmented with the enclosing namespace object, so
/// policies can match on namespace labels.
#[derive(Debug)]
pub struct ReviewRequest {
    pub request: AdmissionRequest<DynamicObject>,
    pub namespace: Option<Namespace>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ReviewOptions {
    pub trace: bool,
}

/// The engine's verdict for a single admission review.
#[derive(Debug, Default)]
pub struct Responses {
    pub results: Vec<ReviewResult>,
    pub trace: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReviewResult {
    pub constraint: ConstraintRef,
    pub enforcement_action: EnforcementAction,
    pub message: String,
}

/// Identifies the constraint that produced a review result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstraintRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

/// A policy's directive on what to do with a matching request.
///
/// Unrecognized actions are carried verbatim so the enforcement-action
/// validator can decide whether to reject them.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EnforcementAction {
    Deny,
    Dryrun,
    Unrecognized(String),
}

#[derive(Debug, Error, PartialEq)]
#[error("could not find the provided enforcement action: {0}")]
pub struct UnsupportedEnforcementAction(pub String);

impl EnforcementAction {
    /// Validates the action against the supported allow-list.
    pub fn validate(&self) -> Result<(), UnsupportedEnforcementAction> {
        match self {
            EnforcementAction::Deny | EnforcementAction::Dryrun => Ok(()),
            EnforcementAction::Unrecognized(s) => {
                Err(UnsupportedEnforcementAction(s.clone()))
            }
        }
    }
}

impl FromStr for EnforcementAction {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "deny" => EnforcementAction::Deny,
            "dryrun" => EnforcementAction::Dryrun,
            other => EnforcementAction::Unrecognized(other.to_string()),
        })
    }
}

impl fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnforcementAction::Deny => "deny".fmt(f),
            EnforcementAction::Dryrun => "dryrun".fmt(f),
            EnforcementAction::Unrecognized(s) => s.fmt(f),
        }
    }
}

/// The terminal classification of an admission request, used for metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResponseClass {
    Allow,
    Deny,
    Error,
    Unknown,
}

impl ResponseClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseClass::Allow => "allow",
            ResponseClass::Deny => "deny",
            ResponseClass::Error => "error",
            ResponseClass::Unknown => "unknown",
        }
    }
}
