use crate::{
    admission::{Admission, NamespaceCache, Settings},
    certs::CertRotator,
    controllers::{
        ConfigController, ConfigState, ConstraintController, MetricsCache, SyncController,
        SyncMetrics, TemplateController,
    },
    core::Engine,
    k8s::{self, ResourceExt},
    metrics::AdmissionMetrics,
    watch::{ApiServerDiscovery, KubeFabricFactory, Manager},
};
use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info_span, Instrument};

// The maximum number of fabric events to buffer per controller while its
// reconcile loop is busy with the API server.
const EVENT_QUEUE_SIZE: usize = 1024;

#[derive(Debug, Parser)]
#[clap(name = "gatekeeper", about = "An admission policy controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "gatekeeper=info,warn",
        env = "GATEKEEPER_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, env = "POD_NAMESPACE", default_value = "gatekeeper-system")]
    system_namespace: String,

    #[clap(long, default_value = "gatekeeper-webhook-service")]
    webhook_service_name: String,

    #[clap(long, default_value = "gatekeeper-webhook-server-cert")]
    cert_secret_name: String,

    #[clap(long, default_value = "gatekeeper-validating-webhook-configuration")]
    webhook_config_name: String,

    #[clap(long, default_value = "gatekeeper-admin")]
    service_account_name: String,

    /// Caps concurrent admission reviews; unset means unlimited.
    #[clap(long)]
    max_serving_threads: Option<usize>,

    /// Logs every deny and dryrun violation.
    #[clap(long)]
    log_denies: bool,

    /// Publishes an event for every deny and dryrun violation.
    #[clap(long)]
    emit_admission_events: bool,

    #[clap(long)]
    disable_enforcement_action_validation: bool,

    /// Disables certificate management; the serving certificate must be
    /// provisioned externally.
    #[clap(long)]
    disable_cert_rotation: bool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run(engine: Arc<dyn Engine>) -> Result<()> {
        Self::parse().run(engine).await
    }

    pub async fn run(self, engine: Arc<dyn Engine>) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            system_namespace,
            webhook_service_name,
            cert_secret_name,
            webhook_config_name,
            service_account_name,
            max_serving_threads,
            log_denies,
            emit_admission_events,
            disable_enforcement_action_validation,
            disable_cert_rotation,
        } = self;

        let sync_cache = MetricsCache::shared();

        let mut prom = <Registry>::default();
        let gatekeeper = prom.sub_registry_with_prefix("gatekeeper");
        let sync_metrics = SyncMetrics::register(gatekeeper, sync_cache.clone());
        let admission_metrics = AdmissionMetrics::register(gatekeeper);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_server(server)
            .build()
            .await?;

        let client = runtime.client();

        if !disable_cert_rotation {
            let rotator = CertRotator::new(
                client.clone(),
                system_namespace.clone(),
                webhook_service_name.clone(),
                cert_secret_name.clone(),
                webhook_config_name.clone(),
            );
            // The server must never come up without a usable certificate, so
            // the first refresh happens here and failure is fatal.
            rotator.bootstrap().await?;
            tokio::spawn(
                rotator
                    .run(runtime.shutdown_handle())
                    .instrument(info_span!("cert_rotator")),
            );
        }

        // Mirror namespaces so reviews can attach the enclosing namespace
        // without an API round trip.
        let namespaces = NamespaceCache::default();
        let ns_events = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            mirror_namespaces(namespaces.clone(), ns_events).instrument(info_span!("namespaces")),
        );

        let manager = Arc::new(Manager::new(
            Arc::new(KubeFabricFactory::new(client.clone())),
            Arc::new(ApiServerDiscovery::new(client.clone())),
        ));
        tokio::spawn({
            let manager = manager.clone();
            let drain = runtime.shutdown_handle();
            async move { manager.run(drain).await }.instrument(info_span!("watch_manager"))
        });

        let (constraint_tx, constraint_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (sync_tx, sync_rx) = mpsc::channel(EVENT_QUEUE_SIZE);

        let sync_registrar = manager.registrar(
            "config-sync",
            Box::new(move |plan, gvk| {
                plan.subscribe(gvk, sync_tx.clone());
                Ok(())
            }),
        )?;

        let config_state = ConfigState::shared();
        tokio::spawn(
            ConfigController::new(client.clone(), config_state.clone(), sync_registrar)
                .run(runtime.shutdown_handle())
                .instrument(info_span!("config")),
        );

        tokio::spawn(
            TemplateController::new(
                client.clone(),
                engine.clone(),
                manager.clone(),
                constraint_tx,
            )
            .run(runtime.shutdown_handle())
            .instrument(info_span!("templates")),
        );

        tokio::spawn(
            ConstraintController::new(client.clone(), engine.clone(), constraint_rx)
                .run(runtime.shutdown_handle())
                .instrument(info_span!("constraints")),
        );

        tokio::spawn(
            SyncController::new(
                client.clone(),
                engine.clone(),
                sync_rx,
                sync_cache,
                sync_metrics,
            )
            .run(runtime.shutdown_handle())
            .instrument(info_span!("sync")),
        );

        let settings = Settings {
            system_namespace,
            service_account_name,
            log_denies,
            emit_admission_events,
            disable_enforcement_action_validation,
        };
        let admission = Admission::new(
            client,
            engine,
            config_state,
            namespaces,
            settings,
            max_serving_threads,
            admission_metrics,
        );
        let runtime = runtime.spawn_server(admission);

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Maintains the namespace cache from a watch stream. A relist rebuilds the
/// cache from scratch so removed namespaces do not linger.
async fn mirror_namespaces(
    cache: NamespaceCache,
    events: impl Stream<Item = watcher::Event<k8s::Namespace>>,
) {
    tokio::pin!(events);

    let mut relist: Option<ahash::AHashMap<String, k8s::Namespace>> = None;
    while let Some(event) = events.next().await {
        match event {
            watcher::Event::Init => {
                relist = Some(Default::default());
            }
            watcher::Event::InitApply(ns) => match relist.as_mut() {
                Some(buffer) => {
                    buffer.insert(ns.name_any(), ns);
                }
                None => {
                    cache.write().insert(ns.name_any(), ns);
                }
            },
            watcher::Event::InitDone => {
                if let Some(buffer) = relist.take() {
                    *cache.write() = buffer;
                }
            }
            watcher::Event::Apply(ns) => {
                cache.write().insert(ns.name_any(), ns);
            }
            watcher::Event::Delete(ns) => {
                cache.write().remove(&ns.name_any());
            }
        }
    }
}
