use crate::fabric::RegisterFn;
use ahash::{AHashMap, AHashSet};
use gatekeeper_policy_controller_k8s_api::GroupVersionKind;
use parking_lot::RwLock;
use std::{collections::BTreeSet, sync::Arc};

/// The bookkeeping shared by the manager and all registrars: which
/// registrar wants which kinds, and how each registrar's channels are wired
/// into a new fabric.
#[derive(Default)]
pub(crate) struct RecordKeeper {
    inner: RwLock<Records>,
}

#[derive(Default)]
struct Records {
    rosters: AHashMap<String, AHashSet<GroupVersionKind>>,
    callbacks: AHashMap<String, Arc<RegisterFn>>,
}

/// The consolidated intent at one point in time. Each kind carries the
/// (sorted) names of the registrars that want it, so the reconcile loop can
/// tell ownership changes apart from additions and removals.
#[derive(Default)]
pub(crate) struct Intent {
    pub(crate) per_gvk: AHashMap<GroupVersionKind, Interest>,
}

pub(crate) struct Interest {
    pub(crate) registrars: BTreeSet<String>,
    pub(crate) callbacks: Vec<Arc<RegisterFn>>,
}

impl RecordKeeper {
    pub(crate) fn register(&self, name: &str, callback: RegisterFn) -> anyhow::Result<()> {
        let mut records = self.inner.write();
        if records.callbacks.contains_key(name) {
            anyhow::bail!("registrar {name} already exists");
        }
        records.callbacks.insert(name.to_string(), Arc::new(callback));
        records.rosters.insert(name.to_string(), AHashSet::new());
        Ok(())
    }

    pub(crate) fn unregister(&self, name: &str) {
        let mut records = self.inner.write();
        records.callbacks.remove(name);
        records.rosters.remove(name);
    }

    fn with_roster(&self, name: &str, f: impl FnOnce(&mut AHashSet<GroupVersionKind>)) {
        let mut records = self.inner.write();
        if let Some(roster) = records.rosters.get_mut(name) {
            f(roster);
        }
    }

    pub(crate) fn add(&self, name: &str, gvk: GroupVersionKind) {
        self.with_roster(name, |roster| {
            roster.insert(gvk);
        });
    }

    pub(crate) fn remove(&self, name: &str, gvk: &GroupVersionKind) {
        self.with_roster(name, |roster| {
            roster.remove(gvk);
        });
    }

    pub(crate) fn replace(&self, name: &str, gvks: impl IntoIterator<Item = GroupVersionKind>) {
        self.with_roster(name, |roster| {
            roster.clear();
            roster.extend(gvks);
        });
    }

    pub(crate) fn snapshot(&self) -> Intent {
        let records = self.inner.read();
        let mut intent = Intent::default();
        for (name, roster) in &records.rosters {
            let callback = match records.callbacks.get(name) {
                Some(cb) => cb,
                None => continue,
            };
            for gvk in roster {
                let interest = intent
                    .per_gvk
                    .entry(gvk.clone())
                    .or_insert_with(|| Interest {
                        registrars: BTreeSet::new(),
                        callbacks: Vec::new(),
                    });
                interest.registrars.insert(name.clone());
                interest.callbacks.push(callback.clone());
            }
        }
        intent
    }
}

/// A named handle through which one controller declares the kinds it needs
/// watched. Changes take effect on the manager's next reconcile pass.
pub struct Registrar {
    name: String,
    keeper: Arc<RecordKeeper>,
}

impl Registrar {
    pub(crate) fn new(name: String, keeper: Arc<RecordKeeper>) -> Self {
        Self { name, keeper }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_watch(&self, gvk: GroupVersionKind) {
        tracing::debug!(registrar = %self.name, %gvk, "Adding watch");
        self.keeper.add(&self.name, gvk);
    }

    pub fn remove_watch(&self, gvk: &GroupVersionKind) {
        tracing::debug!(registrar = %self.name, %gvk, "Removing watch");
        self.keeper.remove(&self.name, gvk);
    }

    /// Replaces this registrar's entire roster in one step.
    pub fn replace_watches(&self, gvks: impl IntoIterator<Item = GroupVersionKind>) {
        self.keeper.replace(&self.name, gvks);
    }
}
