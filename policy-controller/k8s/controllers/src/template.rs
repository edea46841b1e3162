use ahash::AHashMap as HashMap;
use futures::prelude::*;
use gatekeeper_policy_controller_core::{Engine, Template};
use gatekeeper_policy_controller_k8s_api::{
    self as k8s, template::CreateError, ConstraintTemplate, ResourceExt,
};
use gatekeeper_policy_controller_k8s_watch::{Manager, Registrar, ResourceEvent};
use kube::runtime::watcher;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

const RECONCILE_RETRIES: u32 = 3;

/// Reconciles `ConstraintTemplate` resources: registers each template with
/// the engine, installs a dynamic watch for the constraint kind it
/// declares, and reports the outcome on status.
pub struct TemplateController {
    client: k8s::Client,
    engine: Arc<dyn Engine>,
    manager: Arc<Manager>,
    constraint_events: mpsc::Sender<ResourceEvent>,
    /// One registrar per installed constraint kind.
    registrars: HashMap<String, Registrar>,
    /// Engine-form templates by template name, for removal on delete.
    installed: HashMap<String, Template>,
}

impl TemplateController {
    pub fn new(
        client: k8s::Client,
        engine: Arc<dyn Engine>,
        manager: Arc<Manager>,
        constraint_events: mpsc::Sender<ResourceEvent>,
    ) -> Self {
        Self {
            client,
            engine,
            manager,
            constraint_events,
            registrars: HashMap::default(),
            installed: HashMap::default(),
        }
    }

    pub async fn run(mut self, drain: drain::Watch) {
        let api = k8s::Api::<ConstraintTemplate>::all(self.client.clone());
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
                Some(Ok(watcher::Event::Apply(tmpl)))
                | Some(Ok(watcher::Event::InitApply(tmpl))) => {
                    if let Err(error) = self.apply_retrying(&tmpl).await {
                        tracing::error!(template = %tmpl.name_any(), %error, "Failed to reconcile template");
                    }
                }
                Some(Ok(watcher::Event::Delete(tmpl))) => {
                    if let Err(error) = self.delete_retrying(&tmpl).await {
                        tracing::error!(template = %tmpl.name_any(), %error, "Failed to remove template");
                    }
                }
                Some(Ok(watcher::Event::Init)) | Some(Ok(watcher::Event::InitDone)) => {}
                Some(Err(error)) => {
                    tracing::warn!(%error, "Template watch error");
                }
                None => return,
            }
        }
    }

    async fn apply_retrying(&mut self, tmpl: &ConstraintTemplate) -> anyhow::Result<()> {
        let mut attempt = 0;
        loop {
            match self.apply(tmpl).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < RECONCILE_RETRIES => {
                    attempt += 1;
                    tracing::debug!(template = %tmpl.name_any(), %error, attempt, "Retrying template reconcile");
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn delete_retrying(&mut self, tmpl: &ConstraintTemplate) -> anyhow::Result<()> {
        let mut attempt = 0;
        loop {
            match self.delete(tmpl).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < RECONCILE_RETRIES => {
                    attempt += 1;
                    tracing::debug!(template = %tmpl.name_any(), %error, attempt, "Retrying template removal");
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn apply(&mut self, tmpl: &ConstraintTemplate) -> anyhow::Result<()> {
        let name = tmpl.name_any();

        let template = match Template::try_from(tmpl) {
            Ok(t) => t,
            Err(error) => {
                // A malformed template is a user problem; report it on
                // status and wait for an update.
                self.set_status_error(&name, "conversion_error", &error.to_string())
                    .await?;
                return Ok(());
            }
        };

        if let Err(error) = self.engine.add_template(&template).await {
            tracing::info!(template = %name, %error, "Template rejected by engine");
            self.set_status_error(&name, "ingest_error", &error.to_string())
                .await?;
            return Ok(());
        }

        if !self.registrars.contains_key(&template.kind) {
            let registrar_name = format!("constraint-{}", template.kind.to_lowercase());
            let tx = self.constraint_events.clone();
            let registrar = self.manager.registrar(
                &registrar_name,
                Box::new(move |plan, gvk| {
                    plan.subscribe(gvk, tx.clone());
                    Ok(())
                }),
            )?;
            registrar.add_watch(k8s::constraint_gvk(&template.kind));
            self.registrars.insert(template.kind.clone(), registrar);
        }

        tracing::info!(template = %name, kind = %template.kind, "Template installed");
        self.installed.insert(name.clone(), template);
        self.set_status_created(&name).await
    }

    async fn delete(&mut self, tmpl: &ConstraintTemplate) -> anyhow::Result<()> {
        let name = tmpl.name_any();
        let template = match self.installed.get(&name) {
            Some(t) => t,
            // Never successfully installed; nothing to undo.
            None => return Ok(()),
        };

        // The entry is forgotten only once the engine has removed the
        // template; a failure here leaves it in place for the retry.
        self.engine.remove_template(template).await?;
        let kind = template.kind.clone();
        self.installed.remove(&name);

        if let Some(registrar) = self.registrars.remove(&kind) {
            self.manager.remove_registrar(registrar).await?;
        }
        tracing::info!(template = %name, kind = %kind, "Template removed");
        Ok(())
    }

    async fn set_status_created(&self, name: &str) -> anyhow::Result<()> {
        self.patch_status(
            name,
            serde_json::json!({ "status": { "created": true, "errors": null } }),
        )
        .await
    }

    async fn set_status_error(&self, name: &str, code: &str, message: &str) -> anyhow::Result<()> {
        let errors = vec![CreateError {
            code: Some(code.to_string()),
            message: message.to_string(),
        }];
        self.patch_status(
            name,
            serde_json::json!({ "status": { "created": false, "errors": errors } }),
        )
        .await
    }

    async fn patch_status(&self, name: &str, status: serde_json::Value) -> anyhow::Result<()> {
        let api = k8s::Api::<ConstraintTemplate>::all(self.client.clone());
        api.patch_status(
            name,
            &k8s::PatchParams::default(),
            &k8s::Patch::Merge(&status),
        )
        .await?;
        Ok(())
    }
}
