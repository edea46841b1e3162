use crate::{
    discovery::{Discovery, DiscoveryError},
    fabric::{FabricFactory, FabricHandle, FabricPlan},
    manager::Manager,
};
use ahash::AHashMap;
use gatekeeper_policy_controller_k8s_api::GroupVersionKind;
use parking_lot::{Mutex, RwLock};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::mpsc;

/// Serves only the group-versions it has been told about.
#[derive(Default)]
struct FakeDiscovery {
    served: RwLock<AHashMap<(String, String), Vec<String>>>,
}

impl FakeDiscovery {
    fn serve(&self, group: &str, version: &str, kinds: &[&str]) {
        self.served.write().insert(
            (group.to_string(), version.to_string()),
            kinds.iter().map(|k| k.to_string()).collect(),
        );
    }
}

#[async_trait::async_trait]
impl Discovery for FakeDiscovery {
    async fn server_kinds(
        &self,
        group: &str,
        version: &str,
    ) -> Result<Vec<String>, DiscoveryError> {
        self.served
            .read()
            .get(&(group.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| DiscoveryError::NotFound(format!("{group}/{version}")))
    }
}

/// Records the watched set of every fabric generation it spawns, and how
/// many generations have been drained.
#[derive(Default)]
struct FakeFactory {
    spawns: Mutex<Vec<Vec<GroupVersionKind>>>,
    shutdowns: Arc<AtomicUsize>,
}

impl FakeFactory {
    fn spawned(&self) -> Vec<Vec<GroupVersionKind>> {
        self.spawns.lock().clone()
    }

    fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl FabricFactory for FakeFactory {
    fn spawn(&self, plan: FabricPlan) -> anyhow::Result<FabricHandle> {
        let mut gvks = plan.gvks().cloned().collect::<Vec<_>>();
        gvks.sort();
        self.spawns.lock().push(gvks);
        let (signal, watch) = drain::channel();
        let shutdowns = self.shutdowns.clone();
        tokio::spawn(async move {
            let release = watch.signaled().await;
            shutdowns.fetch_add(1, Ordering::SeqCst);
            drop(release);
        });
        Ok(FabricHandle::new(signal))
    }
}

fn fixture() -> (Arc<FakeFactory>, Arc<FakeDiscovery>, Manager) {
    let factory = Arc::new(FakeFactory::default());
    let discovery = Arc::new(FakeDiscovery::default());
    let manager = Manager::new(factory.clone(), discovery.clone());
    (factory, discovery, manager)
}

fn pods() -> GroupVersionKind {
    GroupVersionKind::new("", "v1", "Pod")
}

fn subscribe_all(tx: mpsc::Sender<crate::ResourceEvent>) -> crate::RegisterFn {
    Box::new(move |plan, gvk| {
        plan.subscribe(gvk, tx.clone());
        Ok(())
    })
}

#[tokio::test]
async fn starts_watches_for_served_kinds() {
    let (factory, discovery, manager) = fixture();
    discovery.serve("", "v1", &["Pod", "Namespace"]);

    let (tx, _rx) = mpsc::channel(1);
    let registrar = manager.registrar("test", subscribe_all(tx)).unwrap();
    registrar.add_watch(pods());

    manager.reconcile().await.unwrap();
    assert_eq!(factory.spawned(), vec![vec![pods()]]);
    assert_eq!(manager.managed_gvks(), vec![pods()]);
}

#[tokio::test]
async fn unserved_group_version_is_retained_and_retried() {
    let (factory, discovery, manager) = fixture();

    let (tx, _rx) = mpsc::channel(1);
    let registrar = manager.registrar("test", subscribe_all(tx)).unwrap();
    registrar.add_watch(pods());

    manager.reconcile().await.unwrap();
    assert!(factory.spawned().is_empty());
    // The roster reports intent even while the kind cannot be watched.
    assert_eq!(manager.managed_gvks(), vec![pods()]);

    // The kind starts being served; intent was retained, so the next pass
    // picks it up without the registrar re-declaring it.
    discovery.serve("", "v1", &["Pod"]);
    manager.reconcile().await.unwrap();
    assert_eq!(factory.spawned(), vec![vec![pods()]]);
}

#[tokio::test]
async fn unchanged_intent_does_not_restart_the_fabric() {
    let (factory, discovery, manager) = fixture();
    discovery.serve("", "v1", &["Pod"]);

    let (tx, _rx) = mpsc::channel(1);
    let registrar = manager.registrar("test", subscribe_all(tx)).unwrap();
    registrar.add_watch(pods());

    manager.reconcile().await.unwrap();
    manager.reconcile().await.unwrap();
    manager.reconcile().await.unwrap();
    assert_eq!(factory.spawned().len(), 1);
}

#[tokio::test]
async fn duplicate_registrar_names_are_rejected() {
    let (_, _, manager) = fixture();
    let (tx, _rx) = mpsc::channel(1);
    manager.registrar("dup", subscribe_all(tx.clone())).unwrap();
    assert!(manager.registrar("dup", subscribe_all(tx)).is_err());
}

#[tokio::test]
async fn removing_a_registrar_tears_down_its_watches() {
    let (factory, discovery, manager) = fixture();
    discovery.serve("", "v1", &["Pod", "Namespace"]);
    let namespaces = GroupVersionKind::new("", "v1", "Namespace");

    let (tx, _rx) = mpsc::channel(1);
    let a = manager.registrar("a", subscribe_all(tx.clone())).unwrap();
    a.add_watch(pods());
    let b = manager.registrar("b", subscribe_all(tx)).unwrap();
    b.add_watch(namespaces.clone());

    manager.reconcile().await.unwrap();
    assert_eq!(manager.managed_gvks(), vec![namespaces.clone(), pods()]);

    manager.remove_registrar(b).await.unwrap();
    assert_eq!(manager.managed_gvks(), vec![pods()]);
    assert_eq!(factory.spawned().last().unwrap(), &vec![pods()]);
}

#[tokio::test]
async fn shared_kind_survives_one_registrar_dropping_it() {
    let (factory, discovery, manager) = fixture();
    discovery.serve("", "v1", &["Pod"]);

    let (tx, _rx) = mpsc::channel(1);
    let a = manager.registrar("a", subscribe_all(tx.clone())).unwrap();
    a.add_watch(pods());
    let b = manager.registrar("b", subscribe_all(tx)).unwrap();
    b.add_watch(pods());

    manager.reconcile().await.unwrap();
    let spawns = factory.spawned().len();

    // The other registrar still wants Pods, so the fabric restarts with
    // the same kind but only one subscriber.
    a.remove_watch(&pods());
    manager.reconcile().await.unwrap();
    assert_eq!(manager.managed_gvks(), vec![pods()]);
    assert_eq!(factory.spawned().len(), spawns + 1);
}

#[tokio::test]
async fn failed_wiring_leaves_the_previous_fabric_running() {
    let (factory, discovery, manager) = fixture();
    discovery.serve("", "v1", &["Pod", "Namespace"]);

    let (tx, _rx) = mpsc::channel(1);
    let a = manager.registrar("a", subscribe_all(tx)).unwrap();
    a.add_watch(pods());
    manager.reconcile().await.unwrap();

    let namespaces = GroupVersionKind::new("", "v1", "Namespace");
    let b = manager
        .registrar("b", Box::new(|_, _| anyhow::bail!("wiring failed")))
        .unwrap();
    b.add_watch(namespaces.clone());

    assert!(manager.reconcile().await.is_err());
    // The failed intent stays on the roster; the fabric is untouched.
    assert_eq!(manager.managed_gvks(), vec![namespaces, pods()]);
    assert_eq!(factory.spawned().len(), 1);
}

#[tokio::test]
async fn pause_stops_the_fabric_and_resume_rebuilds_it() {
    let (factory, discovery, manager) = fixture();
    discovery.serve("", "v1", &["Pod"]);

    let (tx, _rx) = mpsc::channel(1);
    let registrar = manager.registrar("test", subscribe_all(tx)).unwrap();
    registrar.add_watch(pods());
    manager.reconcile().await.unwrap();
    assert_eq!(factory.spawned().len(), 1);
    assert_eq!(factory.shutdown_count(), 0);

    // The watches are drained before pause() returns, and reconciliation
    // is inert until resumed.
    manager.pause().await.unwrap();
    assert_eq!(factory.shutdown_count(), 1);
    manager.reconcile().await.unwrap();
    assert_eq!(factory.spawned().len(), 1);

    manager.resume().await;
    manager.reconcile().await.unwrap();
    assert_eq!(factory.spawned().len(), 2);
    assert_eq!(factory.spawned().last().unwrap(), &vec![pods()]);
    assert_eq!(manager.managed_gvks(), vec![pods()]);
}
