use ahash::AHashMap;
use futures::prelude::*;
use gatekeeper_policy_controller_k8s_api::{Api, DynamicObject, GroupVersionKind};
use kube::runtime::watcher;
use tokio::sync::mpsc;

/// A change observed by the informer fabric for a watched kind.
#[derive(Clone, Debug)]
pub enum ResourceEvent {
    Applied(DynamicObject, GroupVersionKind),
    Deleted(DynamicObject, GroupVersionKind),
}

impl ResourceEvent {
    pub fn gvk(&self) -> &GroupVersionKind {
        match self {
            ResourceEvent::Applied(_, gvk) | ResourceEvent::Deleted(_, gvk) => gvk,
        }
    }
}

/// Wires a controller's event channel into the plan for a kind it asked to
/// watch. Invoked once per watched kind each time the fabric is rebuilt.
pub type RegisterFn =
    Box<dyn Fn(&mut FabricPlan, &GroupVersionKind) -> anyhow::Result<()> + Send + Sync>;

/// The blueprint for a fabric generation: every kind to watch and the
/// channels its events feed.
#[derive(Default)]
pub struct FabricPlan {
    subscriptions: AHashMap<GroupVersionKind, Vec<mpsc::Sender<ResourceEvent>>>,
}

impl FabricPlan {
    pub fn subscribe(&mut self, gvk: &GroupVersionKind, tx: mpsc::Sender<ResourceEvent>) {
        self.subscriptions.entry(gvk.clone()).or_default().push(tx);
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn gvks(&self) -> impl Iterator<Item = &GroupVersionKind> {
        self.subscriptions.keys()
    }

    pub(crate) fn into_subscriptions(
        self,
    ) -> AHashMap<GroupVersionKind, Vec<mpsc::Sender<ResourceEvent>>> {
        self.subscriptions
    }
}

/// A running fabric generation. Dropping the handle without calling
/// [`FabricHandle::shutdown`] aborts the watches without waiting for them.
pub struct FabricHandle {
    signal: drain::Signal,
}

impl FabricHandle {
    pub fn new(signal: drain::Signal) -> Self {
        Self { signal }
    }

    /// Stops all watches in this generation and waits for their tasks to
    /// release the drain handle.
    pub async fn shutdown(self) {
        self.signal.drain().await;
    }
}

/// Builds a running fabric from a plan. Injectable so the reconcile loop
/// can be driven without an API server.
pub trait FabricFactory: Send + Sync + 'static {
    fn spawn(&self, plan: FabricPlan) -> anyhow::Result<FabricHandle>;
}

/// Spawns one watch task per kind against the API server.
pub struct KubeFabricFactory {
    client: kube::Client,
}

impl KubeFabricFactory {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

impl FabricFactory for KubeFabricFactory {
    fn spawn(&self, plan: FabricPlan) -> anyhow::Result<FabricHandle> {
        let (signal, watch) = drain::channel();

        for (gvk, txs) in plan.into_subscriptions() {
            let api = Api::<DynamicObject>::all_with(self.client.clone(), &gvk.api_resource());
            tokio::spawn(watch_kind(api, gvk, txs, watch.clone()));
        }
        drop(watch);

        Ok(FabricHandle::new(signal))
    }
}

async fn watch_kind(
    api: Api<DynamicObject>,
    gvk: GroupVersionKind,
    txs: Vec<mpsc::Sender<ResourceEvent>>,
    watch: drain::Watch,
) {
    let events = watcher(api, watcher::Config::default());
    tokio::pin!(events);

    let drained = watch.signaled();
    tokio::pin!(drained);

    loop {
        let event = tokio::select! {
            _ = &mut drained => {
                tracing::debug!(%gvk, "Watch shutting down");
                return;
            }
            event = events.next() => event,
        };

        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(error)) => {
                tracing::warn!(%gvk, %error, "Watch stream error");
                continue;
            }
            None => {
                tracing::debug!(%gvk, "Watch stream ended");
                return;
            }
        };

        let event = match event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                ResourceEvent::Applied(obj, gvk.clone())
            }
            watcher::Event::Delete(obj) => ResourceEvent::Deleted(obj, gvk.clone()),
            watcher::Event::Init | watcher::Event::InitDone => continue,
        };

        for tx in &txs {
            if tx.send(event.clone()).await.is_err() {
                tracing::debug!(%gvk, "Subscriber dropped");
            }
        }
    }
}
