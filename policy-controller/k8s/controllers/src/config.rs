use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use futures::prelude::*;
use gatekeeper_policy_controller_k8s_api::{self as k8s, Config, ResourceExt};
use gatekeeper_policy_controller_k8s_watch::Registrar;
use kube::runtime::watcher;
use parking_lot::RwLock;
use std::sync::Arc;

pub const PROCESS_WEBHOOK: &str = "webhook";
pub const PROCESS_STAR: &str = "*";

pub type SharedConfigState = Arc<ConfigState>;

/// Cluster configuration shared between the config controller (writer) and
/// the admission handler (reader): which namespaces each process ignores,
/// and which requests are traced.
#[derive(Default)]
pub struct ConfigState {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    excluded: HashMap<String, HashSet<String>>,
    traces: Vec<TraceSelector>,
}

struct TraceSelector {
    user: String,
    kind: Option<k8s::config::TraceKind>,
}

impl ConfigState {
    pub fn shared() -> SharedConfigState {
        Arc::new(Self::default())
    }

    /// Whether the given process should skip the namespace. The `*` process
    /// excludes a namespace for every process.
    pub fn is_namespace_excluded(&self, process: &str, namespace: &str) -> bool {
        let inner = self.inner.read();
        [process, PROCESS_STAR].iter().any(|p| {
            inner
                .excluded
                .get(*p)
                .is_some_and(|set| set.contains(namespace))
        })
    }

    /// Whether a review by `user` of the given kind should be traced.
    pub fn trace_enabled(&self, user: &str, group: &str, version: &str, kind: &str) -> bool {
        let inner = self.inner.read();
        inner.traces.iter().any(|t| {
            t.user == user
                && t.kind.as_ref().is_none_or(|k| {
                    k.group == group && k.version == version && k.kind == kind
                })
        })
    }

    pub fn apply(&self, config: &Config) {
        let mut excluded = HashMap::<String, HashSet<String>>::default();
        for entry in &config.spec.match_ {
            for process in &entry.processes {
                excluded
                    .entry(process.clone())
                    .or_default()
                    .extend(entry.excluded_namespaces.iter().cloned());
            }
        }

        let traces = config
            .spec
            .validation
            .iter()
            .flat_map(|v| v.traces.iter())
            .map(|t| TraceSelector {
                user: t.user.clone(),
                kind: t.kind.clone(),
            })
            .collect();

        let mut inner = self.inner.write();
        inner.excluded = excluded;
        inner.traces = traces;
    }

    fn clear(&self) {
        let mut inner = self.inner.write();
        inner.excluded.clear();
        inner.traces.clear();
    }
}

/// Watches the singleton `Config` resource, keeping the shared state and
/// the sync controller's watch roster in step with it.
pub struct ConfigController {
    client: k8s::Client,
    state: SharedConfigState,
    sync_registrar: Registrar,
}

impl ConfigController {
    pub fn new(client: k8s::Client, state: SharedConfigState, sync_registrar: Registrar) -> Self {
        Self {
            client,
            state,
            sync_registrar,
        }
    }

    pub async fn run(self, drain: drain::Watch) {
        let api = k8s::Api::<Config>::all(self.client.clone());
        let events = watcher(api, watcher::Config::default());
        tokio::pin!(events);

        let drained = drain.signaled();
        tokio::pin!(drained);

        loop {
            let event = tokio::select! {
                _ = &mut drained => return,
                event = events.next() => event,
            };
            match event {
                Some(Ok(watcher::Event::Apply(config)))
                | Some(Ok(watcher::Event::InitApply(config))) => self.apply(&config),
                Some(Ok(watcher::Event::Delete(config))) => self.delete(&config),
                Some(Ok(watcher::Event::Init)) | Some(Ok(watcher::Event::InitDone)) => {}
                Some(Err(error)) => {
                    tracing::warn!(%error, "Config watch error");
                }
                None => return,
            }
        }
    }

    fn apply(&self, config: &Config) {
        if config.name_any() != k8s::CONFIG_NAME {
            tracing::warn!(name = %config.name_any(), "Ignoring unrecognized Config");
            return;
        }
        tracing::info!("Applying configuration");
        self.state.apply(config);
        self.sync_registrar.replace_watches(config.sync_gvks());
    }

    fn delete(&self, config: &Config) {
        if config.name_any() != k8s::CONFIG_NAME {
            return;
        }
        tracing::info!("Configuration deleted; reverting to defaults");
        self.state.clear();
        self.sync_registrar.replace_watches([]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(spec: serde_json::Value) -> Config {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "config.gatekeeper.sh/v1alpha1",
            "kind": "Config",
            "metadata": { "name": "config", "namespace": "gatekeeper-system" },
            "spec": spec,
        }))
        .unwrap()
    }

    #[test]
    fn excludes_namespaces_per_process() {
        let state = ConfigState::default();
        state.apply(&config(serde_json::json!({
            "match": [
                { "processes": ["webhook"], "excludedNamespaces": ["kube-system"] },
                { "processes": ["*"], "excludedNamespaces": ["everywhere"] },
            ]
        })));

        assert!(state.is_namespace_excluded(PROCESS_WEBHOOK, "kube-system"));
        assert!(!state.is_namespace_excluded("audit", "kube-system"));
        assert!(state.is_namespace_excluded("audit", "everywhere"));
        assert!(state.is_namespace_excluded(PROCESS_WEBHOOK, "everywhere"));
        assert!(!state.is_namespace_excluded(PROCESS_WEBHOOK, "default"));
    }

    #[test]
    fn traces_match_on_user_and_kind() {
        let state = ConfigState::default();
        state.apply(&config(serde_json::json!({
            "validation": {
                "traces": [
                    { "user": "alice" },
                    { "user": "bob", "kind": { "group": "", "version": "v1", "kind": "Pod" } },
                ]
            }
        })));

        assert!(state.trace_enabled("alice", "apps", "v1", "Deployment"));
        assert!(state.trace_enabled("bob", "", "v1", "Pod"));
        assert!(!state.trace_enabled("bob", "", "v1", "Secret"));
        assert!(!state.trace_enabled("carol", "", "v1", "Pod"));
    }

    #[test]
    fn clear_resets_to_defaults() {
        let state = ConfigState::default();
        state.apply(&config(serde_json::json!({
            "match": [{ "processes": ["webhook"], "excludedNamespaces": ["ns1"] }]
        })));
        assert!(state.is_namespace_excluded(PROCESS_WEBHOOK, "ns1"));

        state.clear();
        assert!(!state.is_namespace_excluded(PROCESS_WEBHOOK, "ns1"));
    }
}
