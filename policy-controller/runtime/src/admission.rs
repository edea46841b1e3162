use crate::{
    controllers::{SharedConfigState, PROCESS_WEBHOOK},
    core::{Engine, EnforcementAction, ResponseClass, ReviewOptions, ReviewRequest},
    k8s::{self, ResourceExt},
    metrics::AdmissionMetrics,
    validation,
};
use ahash::AHashMap;
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use k8s_openapi::api::core::v1::{Event as CoreEvent, EventSource};
use kube::core::DynamicObject;
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, trace, warn};

const SELF_MANAGE_MESSAGE: &str = "Gatekeeper does not self-manage";
const EXCLUDED_NAMESPACE_MESSAGE: &str = "Namespace is set to be ignored by Gatekeeper config";
const DELETE_UNSUPPORTED_MESSAGE: &str =
    "For admission webhooks registered for DELETE operations, please use Kubernetes v1.15.0+.";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type Operation = kube::core::admission::Operation;

type Body = http_body_util::Full<bytes::Bytes>;

/// Namespaces mirrored from the cluster, so reviews can usually attach the
/// enclosing namespace without an API round trip.
pub(crate) type NamespaceCache = Arc<RwLock<AHashMap<String, k8s::Namespace>>>;

/// Settings that shape individual reviews, fixed at startup.
pub(crate) struct Settings {
    pub(crate) system_namespace: String,
    pub(crate) service_account_name: String,
    pub(crate) log_denies: bool,
    pub(crate) emit_admission_events: bool,
    pub(crate) disable_enforcement_action_validation: bool,
}

#[derive(Clone)]
pub struct Admission {
    client: k8s::Client,
    engine: Arc<dyn Engine>,
    config: SharedConfigState,
    namespaces: NamespaceCache,
    settings: Arc<Settings>,
    semaphore: Option<Arc<Semaphore>>,
    metrics: AdmissionMetrics,
}

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/v1/admit" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            let start = tokio::time::Instant::now();
            let bytes = req.into_body().collect().await?.to_bytes();
            let (rsp, class) = admission.handle(&bytes).await;
            admission.metrics.observe(class, start.elapsed());
            json_response(rsp)
        })
    }
}

impl Admission {
    pub(crate) fn new(
        client: k8s::Client,
        engine: Arc<dyn Engine>,
        config: SharedConfigState,
        namespaces: NamespaceCache,
        settings: Settings,
        max_serving_threads: Option<usize>,
        metrics: AdmissionMetrics,
    ) -> Self {
        Self {
            client,
            engine,
            config,
            namespaces,
            settings: Arc::new(settings),
            semaphore: max_serving_threads.map(|n| Arc::new(Semaphore::new(n))),
            metrics,
        }
    }

    /// Decodes a review body and produces the serialized verdict along
    /// with its metric class. Bodies that cannot be decoded into an
    /// admission request are classified as unknown.
    async fn handle(&self, bytes: &[u8]) -> (Review, ResponseClass) {
        let review: Review = match serde_json::from_slice(bytes) {
            Ok(review) => review,
            Err(error) => {
                warn!(%error, "Failed to parse request body");
                return (
                    AdmissionResponse::invalid(error).into_review(),
                    ResponseClass::Unknown,
                );
            }
        };
        trace!(?review);

        let (rsp, class) = match review.try_into() {
            Ok(req) => {
                debug!(?req);
                self.admit(req).await
            }
            Err(error) => {
                warn!(%error, "Invalid admission request");
                (AdmissionResponse::invalid(error), ResponseClass::Unknown)
            }
        };
        debug!(?rsp);
        (rsp.into_review(), class)
    }

    async fn admit(&self, mut req: AdmissionRequest) -> (AdmissionResponse, ResponseClass) {
        // The controller's own writes must never be blocked by its own
        // policies; a lockout here would be unrecoverable.
        if self.is_own_service_account(&req) {
            return (
                allow_with_message(&req, SELF_MANAGE_MESSAGE),
                ResponseClass::Allow,
            );
        }

        if matches!(req.operation, Operation::Delete) {
            // The API server omits `object` on DELETE and ships the
            // existing object as `oldObject` (since v1.15). Review that.
            match req.old_object.take() {
                Some(old) => req.object = Some(old),
                None => {
                    return (
                        deny_with_code(&req, DELETE_UNSUPPORTED_MESSAGE, 500),
                        ResponseClass::Error,
                    )
                }
            }
        }

        if let Err(error) = validation::validate_policy_resource(
            &*self.engine,
            &req,
            self.settings.disable_enforcement_action_validation,
        )
        .await
        {
            let code = error.code();
            return (
                deny_with_code(&req, &error.to_string(), code),
                ResponseClass::Error,
            );
        }

        if let Some(ns) = req.namespace.as_deref() {
            if self.config.is_namespace_excluded(PROCESS_WEBHOOK, ns) {
                return (
                    allow_with_message(&req, EXCLUDED_NAMESPACE_MESSAGE),
                    ResponseClass::Allow,
                );
            }
        }

        let _permit = match &self.semaphore {
            Some(semaphore) => {
                let pending = self.metrics.pending();
                let permit = semaphore.clone().acquire_owned().await;
                drop(pending);
                permit.ok()
            }
            None => None,
        };

        self.evaluate(req).await
    }

    async fn evaluate(&self, mut req: AdmissionRequest) -> (AdmissionResponse, ResponseClass) {
        // Server-side apply of a Namespace carries the namespace's own name
        // in `namespace`; older request forms leave it empty. Normalize so
        // policies see one shape.
        if req.kind.kind == "Namespace" && req.kind.group.is_empty() {
            req.namespace = None;
        }

        let namespace = match req.namespace.as_deref() {
            Some(name) if !name.is_empty() => match self.namespace(name).await {
                Ok(ns) => Some(ns),
                Err(error) => {
                    warn!(%error, namespace = %name, "Failed to fetch request namespace");
                    return (
                        deny_with_code(&req, &error.to_string(), 500),
                        ResponseClass::Error,
                    );
                }
            },
            _ => None,
        };

        let user = req.user_info.username.clone().unwrap_or_default();
        let trace =
            self.config
                .trace_enabled(&user, &req.kind.group, &req.kind.version, &req.kind.kind);

        // The request is consumed by the review; retain what the response
        // and violation records need.
        let rsp = AdmissionResponse::from(&req);
        let request_kind = req.kind.clone();
        let request_namespace = req.namespace.clone().unwrap_or_default();
        let resource_name = if !req.name.is_empty() {
            req.name.clone()
        } else {
            // CREATE requests may rely on server-side name generation.
            req.object.as_ref().map(|o| o.name_any()).unwrap_or_default()
        };

        let review = ReviewRequest {
            request: req,
            namespace,
        };
        let responses = match self.engine.review(review, ReviewOptions { trace }).await {
            Ok(responses) => responses,
            Err(error) => {
                // Engine state often explains the failure; best effort.
                match self.engine.dump().await {
                    Ok(dump) => warn!(%error, %dump, "Review failed"),
                    Err(_) => warn!(%error, "Review failed"),
                }
                let mut rsp = rsp.deny(&error);
                rsp.result.code = 500;
                return (rsp, ResponseClass::Error);
            }
        };
        if let Some(trace) = responses.trace {
            info!(%trace, "Review trace");
        }

        let mut deny_messages = Vec::new();
        for result in &responses.results {
            let violation = matches!(
                result.enforcement_action,
                EnforcementAction::Deny | EnforcementAction::Dryrun
            );
            if violation {
                if self.settings.log_denies {
                    info!(
                        process = "admission",
                        event_type = "violation",
                        constraint_name = %result.constraint.name,
                        constraint_group = %result.constraint.group,
                        constraint_api_version = %result.constraint.version,
                        constraint_kind = %result.constraint.kind,
                        constraint_action = %result.enforcement_action,
                        resource_group = %request_kind.group,
                        resource_api_version = %request_kind.version,
                        resource_kind = %request_kind.kind,
                        resource_namespace = %request_namespace,
                        resource_name = %resource_name,
                        request_username = %user,
                        "denied admission",
                    );
                }
                if self.settings.emit_admission_events {
                    self.publish_violation_event(
                        result,
                        &request_kind,
                        &request_namespace,
                        &resource_name,
                        &user,
                    )
                    .await;
                }
            }

            if result.enforcement_action == EnforcementAction::Deny {
                deny_messages.push(format!(
                    "[denied by {}] {}",
                    result.constraint.name, result.message
                ));
            }
        }

        if !deny_messages.is_empty() {
            let mut rsp = rsp.deny(deny_messages.join("\n"));
            rsp.result.code = 403;
            return (rsp, ResponseClass::Deny);
        }

        (rsp, ResponseClass::Allow)
    }

    fn is_own_service_account(&self, req: &AdmissionRequest) -> bool {
        let own = format!(
            "system:serviceaccount:{}:{}",
            self.settings.system_namespace, self.settings.service_account_name,
        );
        req.user_info.username.as_deref() == Some(own.as_str())
    }

    async fn namespace(&self, name: &str) -> anyhow::Result<k8s::Namespace> {
        if let Some(ns) = self.namespaces.read().get(name) {
            return Ok(ns.clone());
        }
        // Not yet mirrored; ask the API server directly.
        let ns = k8s::Api::<k8s::Namespace>::all(self.client.clone())
            .get(name)
            .await?;
        Ok(ns)
    }

    async fn publish_violation_event(
        &self,
        result: &crate::core::ReviewResult,
        request_kind: &kube::core::GroupVersionKind,
        request_namespace: &str,
        resource_name: &str,
        user: &str,
    ) {
        let (message, reason) = if result.enforcement_action == EnforcementAction::Dryrun {
            ("Dryrun violation", "DryrunViolation")
        } else {
            (
                "Admission webhook \"validation.gatekeeper.sh\" denied request",
                "FailedAdmission",
            )
        };

        let constraint = &result.constraint;
        let annotations = BTreeMap::from([
            ("process".to_string(), "admission".to_string()),
            ("event_type".to_string(), "violation".to_string()),
            ("constraint_name".to_string(), constraint.name.clone()),
            ("constraint_group".to_string(), constraint.group.clone()),
            (
                "constraint_api_version".to_string(),
                constraint.version.clone(),
            ),
            ("constraint_kind".to_string(), constraint.kind.clone()),
            (
                "constraint_action".to_string(),
                result.enforcement_action.to_string(),
            ),
            ("resource_group".to_string(), request_kind.group.clone()),
            (
                "resource_api_version".to_string(),
                request_kind.version.clone(),
            ),
            ("resource_kind".to_string(), request_kind.kind.clone()),
            (
                "resource_namespace".to_string(),
                request_namespace.to_string(),
            ),
            ("resource_name".to_string(), resource_name.to_string()),
            ("request_username".to_string(), user.to_string()),
        ]);

        let event = CoreEvent {
            metadata: k8s::ObjectMeta {
                generate_name: Some(format!("{}.", constraint.name)),
                namespace: Some(self.settings.system_namespace.clone()),
                annotations: Some(annotations),
                ..Default::default()
            },
            involved_object: k8s::ObjectReference {
                kind: Some(request_kind.kind.clone()),
                name: Some(resource_name.to_string()),
                namespace: Some(self.settings.system_namespace.clone()),
                uid: Some(
                    [
                        request_kind.kind.as_str(),
                        request_namespace,
                        resource_name,
                        constraint.kind.as_str(),
                        constraint.namespace.as_deref().unwrap_or_default(),
                        constraint.name.as_str(),
                    ]
                    .join("/"),
                ),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(format!(
                "{message}, Resource Namespace: {request_namespace}, Constraint: {}, Message: {}",
                constraint.name, result.message,
            )),
            type_: Some("Warning".to_string()),
            source: Some(EventSource {
                component: Some("gatekeeper-webhook".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let api =
            k8s::Api::<CoreEvent>::namespaced(self.client.clone(), &self.settings.system_namespace);
        if let Err(error) = api.create(&k8s::PostParams::default(), &event).await {
            warn!(%error, reason, "Failed to publish violation event");
        }
    }
}

fn allow_with_message(req: &AdmissionRequest, message: &str) -> AdmissionResponse {
    let mut rsp = AdmissionResponse::from(req);
    rsp.result.message = message.to_string();
    rsp
}

fn deny_with_code(req: &AdmissionRequest, message: impl ToString, code: u16) -> AdmissionResponse {
    let mut rsp = AdmissionResponse::from(req).deny(message.to_string());
    rsp.result.code = code;
    rsp
}

fn json_response(rsp: Review) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}
