use crate::metrics::{SharedMetricsCache, SyncMetrics, SyncStatus};
use gatekeeper_policy_controller_core::Engine;
use gatekeeper_policy_controller_k8s_api::{self as k8s, DynamicObject, ResourceExt};
use gatekeeper_policy_controller_k8s_watch::ResourceEvent;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Mirrors configured data kinds into the engine's data space, tracking
/// per-object sync status for the metrics cache.
pub struct SyncController {
    client: k8s::Client,
    engine: Arc<dyn Engine>,
    events: mpsc::Receiver<ResourceEvent>,
    cache: SharedMetricsCache,
    metrics: SyncMetrics,
}

impl SyncController {
    pub fn new(
        client: k8s::Client,
        engine: Arc<dyn Engine>,
        events: mpsc::Receiver<ResourceEvent>,
        cache: SharedMetricsCache,
        metrics: SyncMetrics,
    ) -> Self {
        Self {
            client,
            engine,
            events,
            cache,
            metrics,
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

            let start = tokio::time::Instant::now();
            if let Err(error) = self.reconcile(&event).await {
                let gvk = event.gvk();
                tracing::error!(%gvk, %error, "Failed to sync object");
            }
            self.metrics.observe(start.elapsed());
        }
    }

    async fn reconcile(&self, event: &ResourceEvent) -> anyhow::Result<()> {
        match event {
            ResourceEvent::Applied(obj, gvk) => {
                let resource = gvk.api_resource();
                let api = match obj.namespace() {
                    Some(ns) => k8s::Api::<DynamicObject>::namespaced_with(
                        self.client.clone(),
                        &ns,
                        &resource,
                    ),
                    None => k8s::Api::<DynamicObject>::all_with(self.client.clone(), &resource),
                };
                // The event may lag the cluster; sync the current object.
                match api.get_opt(&obj.name_any()).await? {
                    Some(current) if current.metadata.deletion_timestamp.is_none() => {
                        self.add(&current, &gvk.kind).await
                    }
                    _ => self.remove(obj).await,
                }
            }
            ResourceEvent::Deleted(obj, _) => self.remove(obj).await,
        }
    }

    async fn add(&self, obj: &DynamicObject, kind: &str) -> anyhow::Result<()> {
        let key = sync_key(obj);
        match self.engine.add_data(obj).await {
            Ok(()) => {
                self.cache.upsert(&key, kind, SyncStatus::Active);
                tracing::debug!(%key, %kind, "Object synced");
                Ok(())
            }
            Err(error) => {
                self.cache.upsert(&key, kind, SyncStatus::Error);
                Err(error.into())
            }
        }
    }

    async fn remove(&self, obj: &DynamicObject) -> anyhow::Result<()> {
        self.engine.remove_data(obj).await?;
        self.cache.delete(&sync_key(obj));
        Ok(())
    }
}

/// `namespace/name`; cluster-scoped objects use an empty namespace segment.
fn sync_key(obj: &DynamicObject) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_key_includes_namespace() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "web", "namespace": "ns1" }
        }))
        .unwrap();
        assert_eq!(sync_key(&obj), "ns1/web");
    }

    #[test]
    fn cluster_scoped_sync_key_has_empty_namespace() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": "ns1" }
        }))
        .unwrap();
        assert_eq!(sync_key(&obj), "/ns1");
    }
}
