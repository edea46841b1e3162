use crate::{
    discovery::{Discovery, DiscoveryError},
    fabric::{FabricFactory, FabricHandle, FabricPlan, RegisterFn},
    registrar::{RecordKeeper, Registrar},
};
use ahash::{AHashMap, AHashSet};
use gatekeeper_policy_controller_k8s_api::GroupVersionKind;
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use thiserror::Error;

const TICK: Duration = Duration::from_secs(5);
const PAUSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
#[error("timed out waiting for the watch manager to pause")]
pub struct PauseError(());

/// Reconciles registrar intent against the running informer fabric.
///
/// Registrars mutate shared intent records; a periodic pass snapshots that
/// intent, filters it through API discovery, and rebuilds the fabric when
/// the effective watched set differs from what is running. Kinds whose
/// group-version is not yet served are retained as intent and retried on
/// every pass, so a watch declared before its CRD installs starts working
/// once the CRD appears.
pub struct Manager {
    keeper: Arc<RecordKeeper>,
    factory: Arc<dyn FabricFactory>,
    discovery: Arc<dyn Discovery>,
    state: tokio::sync::Mutex<State>,
}

#[derive(Default)]
struct State {
    started: bool,
    paused: bool,
    /// The last intent snapshot acted on, used to short-circuit no-op passes.
    desired: AHashMap<GroupVersionKind, BTreeSet<String>>,
    /// What the running fabric actually watches.
    watched: AHashMap<GroupVersionKind, BTreeSet<String>>,
    /// Intent whose group-version discovery could not find; retried each pass.
    pending: AHashSet<GroupVersionKind>,
    fabric: Option<FabricHandle>,
}

impl Manager {
    pub fn new(factory: Arc<dyn FabricFactory>, discovery: Arc<dyn Discovery>) -> Self {
        Self {
            keeper: Arc::new(RecordKeeper::default()),
            factory,
            discovery,
            state: tokio::sync::Mutex::new(State::default()),
        }
    }

    /// Creates a registrar through which a controller declares watches.
    /// Names must be unique across the manager's lifetime-active registrars.
    pub fn registrar(&self, name: &str, callback: RegisterFn) -> anyhow::Result<Registrar> {
        self.keeper.register(name, callback)?;
        Ok(Registrar::new(name.to_string(), self.keeper.clone()))
    }

    /// Retires a registrar and immediately reconciles, so its watches are
    /// torn down before this returns rather than on the next tick.
    pub async fn remove_registrar(&self, registrar: Registrar) -> anyhow::Result<()> {
        self.keeper.unregister(registrar.name());
        self.reconcile().await
    }

    /// The union of every registrar's roster. A read of declared intent,
    /// not a guarantee that each kind is currently watched.
    pub fn managed_gvks(&self) -> Vec<GroupVersionKind> {
        let intent = self.keeper.snapshot();
        let mut gvks = intent.per_gvk.into_keys().collect::<Vec<_>>();
        gvks.sort();
        gvks
    }

    /// Stops the running fabric and suspends reconciliation until
    /// [`Manager::resume`]. The watches are down when this returns; fails
    /// if they do not stop within the pause deadline.
    pub async fn pause(&self) -> Result<(), PauseError> {
        tokio::time::timeout(PAUSE_TIMEOUT, async {
            let mut state = self.state.lock().await;
            state.paused = true;
            if let Some(fabric) = state.fabric.take() {
                fabric.shutdown().await;
            }
            // The first unpaused pass rebuilds from scratch.
            state.watched.clear();
            state.started = false;
        })
        .await
        .map_err(|_| PauseError(()))
    }

    pub async fn resume(&self) {
        self.state.lock().await.paused = false;
    }

    /// Runs the reconcile loop until the drain signal fires, then shuts
    /// down the fabric.
    pub async fn run(&self, drain: drain::Watch) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let drained = drain.signaled();
        tokio::pin!(drained);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                release = &mut drained => {
                    let mut state = self.state.lock().await;
                    if let Some(fabric) = state.fabric.take() {
                        fabric.shutdown().await;
                    }
                    tracing::debug!("Watch manager shut down");
                    drop(release);
                    return;
                }
            }

            if let Err(error) = self.reconcile().await {
                tracing::warn!(%error, "Failed to reconcile watches; retrying");
            }
        }
    }

    /// One reconcile pass: snapshot intent, filter it through discovery,
    /// and rebuild the fabric if the effective watched set changed.
    pub(crate) async fn reconcile(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.paused {
            return Ok(());
        }

        let intent = self.keeper.snapshot();
        let desired = intent
            .per_gvk
            .iter()
            .map(|(gvk, interest)| (gvk.clone(), interest.registrars.clone()))
            .collect::<AHashMap<_, _>>();

        if state.started && desired == state.desired && state.pending.is_empty() {
            return Ok(());
        }

        // Partition the intent by group-version and keep only kinds the API
        // server serves. An unserved group-version is not fatal: its kinds
        // are held as pending intent and retried next pass. Any other
        // discovery failure aborts the pass without touching the fabric.
        let mut served = AHashSet::new();
        let mut pending = AHashSet::new();
        let mut by_gv = AHashMap::<(String, String), Vec<&GroupVersionKind>>::new();
        for gvk in desired.keys() {
            by_gv
                .entry((gvk.group.clone(), gvk.version.clone()))
                .or_default()
                .push(gvk);
        }
        for ((group, version), gvks) in by_gv {
            match self.discovery.server_kinds(&group, &version).await {
                Ok(kinds) => {
                    for gvk in gvks {
                        if kinds.iter().any(|k| k == &gvk.kind) {
                            served.insert(gvk.clone());
                        } else {
                            tracing::debug!(%gvk, "Kind not served; retaining intent");
                            pending.insert(gvk.clone());
                        }
                    }
                }
                Err(DiscoveryError::NotFound(gv)) => {
                    tracing::debug!(%gv, "Group version not served; retaining intent");
                    pending.extend(gvks.into_iter().cloned());
                }
                Err(DiscoveryError::Other(error)) => return Err(error),
            }
        }

        let effective = desired
            .iter()
            .filter(|(gvk, _)| served.contains(*gvk))
            .map(|(gvk, names)| (gvk.clone(), names.clone()))
            .collect::<AHashMap<_, _>>();

        if state.started && effective == state.watched {
            state.desired = desired;
            state.pending = pending;
            return Ok(());
        }

        // Wire the new plan before draining the old fabric, so a callback
        // failure leaves the previous generation running.
        let mut plan = FabricPlan::default();
        for (gvk, interest) in &intent.per_gvk {
            if !served.contains(gvk) {
                continue;
            }
            for callback in &interest.callbacks {
                callback(&mut plan, gvk)?;
            }
        }

        if let Some(fabric) = state.fabric.take() {
            fabric.shutdown().await;
        }
        if !plan.is_empty() {
            tracing::info!(kinds = effective.len(), "Restarting informer fabric");
            state.fabric = Some(self.factory.spawn(plan)?);
        } else {
            tracing::debug!("Nothing to watch");
        }

        state.watched = effective;
        state.desired = desired;
        state.pending = pending;
        state.started = true;
        Ok(())
    }
}
