use gatekeeper_policy_controller_core::{
    Engine, EngineError, Responses, ReviewOptions, ReviewRequest, Template,
};
use gatekeeper_policy_controller_k8s_api::{self as k8s, DynamicObject, ResourceExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// An engine that records what it holds and can be told to fail a number
/// of removal calls before succeeding.
#[derive(Default)]
pub(crate) struct FakeEngine {
    pub(crate) templates: Mutex<Vec<String>>,
    pub(crate) removed_constraints: Mutex<Vec<String>>,
    pub(crate) remove_template_failures: AtomicUsize,
    pub(crate) remove_constraint_failures: AtomicUsize,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait::async_trait]
impl Engine for FakeEngine {
    async fn add_template(&self, template: &Template) -> Result<(), EngineError> {
        self.templates.lock().push(template.name.clone());
        Ok(())
    }

    async fn remove_template(&self, template: &Template) -> Result<(), EngineError> {
        if take_failure(&self.remove_template_failures) {
            return Err(EngineError::Internal(anyhow::anyhow!("engine unavailable")));
        }
        self.templates.lock().retain(|name| name != &template.name);
        Ok(())
    }

    async fn create_crd(&self, _: &Template) -> Result<(), EngineError> {
        Ok(())
    }

    async fn add_constraint(&self, _: &DynamicObject) -> Result<(), EngineError> {
        Ok(())
    }

    async fn remove_constraint(&self, constraint: &DynamicObject) -> Result<(), EngineError> {
        if take_failure(&self.remove_constraint_failures) {
            return Err(EngineError::Internal(anyhow::anyhow!("engine unavailable")));
        }
        self.removed_constraints.lock().push(constraint.name_any());
        Ok(())
    }

    async fn validate_constraint(&self, _: &DynamicObject) -> Result<(), EngineError> {
        Ok(())
    }

    async fn add_data(&self, _: &DynamicObject) -> Result<(), EngineError> {
        Ok(())
    }

    async fn remove_data(&self, _: &DynamicObject) -> Result<(), EngineError> {
        Ok(())
    }

    async fn review(&self, _: ReviewRequest, _: ReviewOptions) -> Result<Responses, EngineError> {
        Ok(Responses::default())
    }

    async fn dump(&self) -> Result<String, EngineError> {
        Ok(String::new())
    }
}

/// A client whose API serves nothing; every request is a 404.
pub(crate) fn mock_client() -> k8s::Client {
    let svc = tower::util::service_fn(|_req: http::Request<kube::client::Body>| async move {
        let status = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": "not found",
            "reason": "NotFound",
            "code": 404,
        });
        let rsp = http::Response::builder()
            .status(http::StatusCode::NOT_FOUND)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(kube::client::Body::from(
                serde_json::to_vec(&status).unwrap(),
            ))
            .unwrap();
        Ok::<_, std::convert::Infallible>(rsp)
    });
    k8s::Client::new(svc, "gatekeeper-system")
}
