use gatekeeper_policy_controller_core::Engine;
use gatekeeper_policy_controller_k8s_api::{
    self as k8s, DynamicObject, GroupVersionKind, ResourceExt,
};
use gatekeeper_policy_controller_k8s_watch::ResourceEvent;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

pub const CONSTRAINT_FINALIZER: &str = "constraint.finalizers.gatekeeper.sh";

const CONFLICT_RETRIES: u32 = 3;
const RECONCILE_RETRIES: u32 = 3;

/// Mirrors constraint objects of every installed kind into the engine.
///
/// A single controller consumes fabric events for all constraint kinds; the
/// event's kind identifier selects the API to reconcile against. The
/// finalizer guarantees the engine forgets a constraint before the API
/// server garbage-collects it.
pub struct ConstraintController {
    client: k8s::Client,
    engine: Arc<dyn Engine>,
    events: mpsc::Receiver<ResourceEvent>,
}

impl ConstraintController {
    pub fn new(
        client: k8s::Client,
        engine: Arc<dyn Engine>,
        events: mpsc::Receiver<ResourceEvent>,
    ) -> Self {
        Self {
            client,
            engine,
            events,
        }
    }

    pub async fn run(mut self, drain: drain::Watch) {
        let drained = drain.signaled();
        tokio::pin!(drained);

        loop {
            let event = tokio::select! {
                _ = &mut drained => return,
                event = self.events.recv() => event,
            };
            let Some(event) = event else { return };

            let name = match &event {
                ResourceEvent::Applied(obj, _) | ResourceEvent::Deleted(obj, _) => obj.name_any(),
            };
            if let Err(error) = self.reconcile_retrying(&event).await {
                let gvk = event.gvk();
                tracing::error!(%gvk, constraint = %name, %error, "Failed to reconcile constraint");
            }
        }
    }

    async fn reconcile_retrying(&self, event: &ResourceEvent) -> anyhow::Result<()> {
        let mut attempt = 0;
        loop {
            match self.reconcile(event).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < RECONCILE_RETRIES => {
                    attempt += 1;
                    tracing::debug!(%error, attempt, "Retrying constraint reconcile");
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn reconcile(&self, event: &ResourceEvent) -> anyhow::Result<()> {
        match event {
            ResourceEvent::Applied(obj, gvk) => self.apply(obj, gvk).await,
            // The finalizer path has normally removed the constraint
            // already; removal is idempotent.
            ResourceEvent::Deleted(obj, _) => self.remove(obj).await,
        }
    }

    async fn apply(&self, obj: &DynamicObject, gvk: &GroupVersionKind) -> anyhow::Result<()> {
        let api = self.api(gvk);
        let name = obj.name_any();

        // Events can be stale; reconcile against the current object.
        let current = match api.get_opt(&name).await? {
            Some(current) => current,
            None => return self.remove(obj).await,
        };

        if current.metadata.deletion_timestamp.is_some() {
            return self.finalize(&api, current).await;
        }

        if !has_finalizer(&current) {
            let mut finalizers = current.finalizers().to_vec();
            finalizers.push(CONSTRAINT_FINALIZER.to_string());
            self.patch_retrying(
                &api,
                &name,
                serde_json::json!({ "metadata": { "finalizers": finalizers } }),
            )
            .await?;
        }

        if let Err(error) = self.engine.add_constraint(&current).await {
            self.patch_retrying(
                &api,
                &name,
                serde_json::json!({
                    "status": { "enforced": false, "errors": [{ "message": error.to_string() }] }
                }),
            )
            .await?;
            return Err(error.into());
        }
        tracing::debug!(%gvk, constraint = %name, "Constraint enforced");
        self.patch_retrying(
            &api,
            &name,
            serde_json::json!({ "status": { "enforced": true, "errors": null } }),
        )
        .await
    }

    /// Removes the constraint from the engine, then releases the finalizer
    /// so the API server can complete the deletion. Strictly in that order.
    async fn finalize(&self, api: &k8s::Api<DynamicObject>, obj: DynamicObject) -> anyhow::Result<()> {
        if !has_finalizer(&obj) {
            return Ok(());
        }
        let name = obj.name_any();
        self.engine.remove_constraint(&obj).await?;

        let finalizers = obj
            .finalizers()
            .iter()
            .filter(|f| *f != CONSTRAINT_FINALIZER)
            .cloned()
            .collect::<Vec<_>>();
        self.patch_retrying(
            api,
            &name,
            serde_json::json!({ "metadata": { "finalizers": finalizers } }),
        )
        .await?;
        tracing::debug!(constraint = %name, "Constraint finalized");
        Ok(())
    }

    async fn remove(&self, obj: &DynamicObject) -> anyhow::Result<()> {
        self.engine.remove_constraint(obj).await?;
        Ok(())
    }

    fn api(&self, gvk: &GroupVersionKind) -> k8s::Api<DynamicObject> {
        k8s::Api::all_with(self.client.clone(), &gvk.api_resource())
    }

    async fn patch_retrying(
        &self,
        api: &k8s::Api<DynamicObject>,
        name: &str,
        patch: serde_json::Value,
    ) -> anyhow::Result<()> {
        let params = k8s::PatchParams::default();
        let mut attempt = 0;
        loop {
            match api.patch(name, &params, &k8s::Patch::Merge(&patch)).await {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(rsp)) if rsp.code == 409 && attempt < CONFLICT_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

fn has_finalizer(obj: &DynamicObject) -> bool {
    obj.finalizers().iter().any(|f| f == CONSTRAINT_FINALIZER)
}
