//! An in-process policy engine.
//!
//! Stores templates, constraints, and mirrored data, enforcing the
//! structural rules of the policy API. Evaluation is pluggable through the
//! [`Engine`] trait; this implementation admits everything it cannot judge,
//! which makes it suitable for development and for wiring tests.

use ahash::AHashMap as HashMap;
use gatekeeper_policy_controller_core::{
    Engine, EngineError, Responses, ReviewOptions, ReviewRequest, Template,
};
use gatekeeper_policy_controller_k8s_api::{DynamicObject, ResourceExt};
use parking_lot::RwLock;

#[derive(Default)]
pub struct MemoryEngine {
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    /// Templates by template name.
    templates: HashMap<String, Template>,
    /// Constraints by (kind, name).
    constraints: HashMap<(String, String), DynamicObject>,
    /// Mirrored data objects by `kind/namespace/name`.
    data: HashMap<String, DynamicObject>,
}

impl State {
    fn kind_installed(&self, kind: &str) -> bool {
        self.templates.values().any(|t| t.kind == kind)
    }
}

fn check_template(template: &Template) -> Result<(), EngineError> {
    if template.targets.is_empty() {
        return Err(EngineError::BadPolicy(format!(
            "template {} declares no targets",
            template.name
        )));
    }
    for target in &template.targets {
        if target.rego.trim().is_empty() {
            return Err(EngineError::BadPolicy(format!(
                "template {} target {} has empty source",
                template.name, target.target
            )));
        }
    }
    Ok(())
}

fn data_key(obj: &DynamicObject) -> String {
    format!(
        "{}/{}/{}",
        obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or(""),
        obj.namespace().unwrap_or_default(),
        obj.name_any(),
    )
}

#[async_trait::async_trait]
impl Engine for MemoryEngine {
    async fn add_template(&self, template: &Template) -> Result<(), EngineError> {
        check_template(template)?;
        self.state
            .write()
            .templates
            .insert(template.name.clone(), template.clone());
        Ok(())
    }

    async fn remove_template(&self, template: &Template) -> Result<(), EngineError> {
        let mut state = self.state.write();
        state.templates.remove(&template.name);
        // Constraints of a removed kind can no longer match anything.
        state
            .constraints
            .retain(|(kind, _), _| kind != &template.kind);
        Ok(())
    }

    async fn create_crd(&self, template: &Template) -> Result<(), EngineError> {
        check_template(template)
    }

    async fn add_constraint(&self, constraint: &DynamicObject) -> Result<(), EngineError> {
        let kind = constraint_kind(constraint)?;
        let mut state = self.state.write();
        if !state.kind_installed(&kind) {
            return Err(EngineError::BadPolicy(format!(
                "no template installed for constraint kind {kind}"
            )));
        }
        state
            .constraints
            .insert((kind, constraint.name_any()), constraint.clone());
        Ok(())
    }

    async fn remove_constraint(&self, constraint: &DynamicObject) -> Result<(), EngineError> {
        let kind = constraint_kind(constraint)?;
        self.state
            .write()
            .constraints
            .remove(&(kind, constraint.name_any()));
        Ok(())
    }

    async fn validate_constraint(&self, constraint: &DynamicObject) -> Result<(), EngineError> {
        let kind = constraint_kind(constraint)?;
        if !self.state.read().kind_installed(&kind) {
            return Err(EngineError::BadPolicy(format!(
                "no template installed for constraint kind {kind}"
            )));
        }
        Ok(())
    }

    async fn add_data(&self, object: &DynamicObject) -> Result<(), EngineError> {
        self.state
            .write()
            .data
            .insert(data_key(object), object.clone());
        Ok(())
    }

    async fn remove_data(&self, object: &DynamicObject) -> Result<(), EngineError> {
        self.state.write().data.remove(&data_key(object));
        Ok(())
    }

    async fn review(
        &self,
        request: ReviewRequest,
        options: ReviewOptions,
    ) -> Result<Responses, EngineError> {
        let trace = options.trace.then(|| {
            let state = self.state.read();
            format!(
                "review uid={} kind={}/{} constraints={} data={}",
                request.request.uid,
                request.request.kind.group,
                request.request.kind.kind,
                state.constraints.len(),
                state.data.len(),
            )
        });
        Ok(Responses {
            results: Vec::new(),
            trace,
        })
    }

    async fn dump(&self) -> Result<String, EngineError> {
        let state = self.state.read();
        let mut templates = state.templates.keys().cloned().collect::<Vec<_>>();
        templates.sort();
        let mut constraints = state
            .constraints
            .keys()
            .map(|(kind, name)| format!("{kind}/{name}"))
            .collect::<Vec<_>>();
        constraints.sort();
        let mut data = state.data.keys().cloned().collect::<Vec<_>>();
        data.sort();

        serde_json::to_string_pretty(&serde_json::json!({
            "templates": templates,
            "constraints": constraints,
            "data": data,
        }))
        .map_err(|e| EngineError::Internal(e.into()))
    }
}

fn constraint_kind(constraint: &DynamicObject) -> Result<String, EngineError> {
    constraint
        .types
        .as_ref()
        .map(|t| t.kind.clone())
        .ok_or_else(|| EngineError::BadPolicy("constraint is missing a kind".to_string()))
}
