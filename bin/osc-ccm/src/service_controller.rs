//! Service controller reconciling LoadBalancer Services

use crate::provider::Provider;
use ccm_core::CcmError;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Node, Service};
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::Action;
use kube_runtime::finalizer::{finalizer, Event};
use kube_runtime::{watcher, Controller};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

pub const LOAD_BALANCER_FINALIZER: &str = "service.osc.outscale.com/load-balancer-cleanup";

/// Converged Services are revisited to follow node membership changes
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Cloud(#[from] CcmError),

    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<kube_runtime::finalizer::Error<ReconcileError>>),
}

pub struct Context {
    client: Client,
    provider: Arc<Provider>,
}

pub fn is_load_balancer(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        == Some("LoadBalancer")
}

fn has_finalizer(service: &Service) -> bool {
    service.finalizers().iter().any(|f| f == LOAD_BALANCER_FINALIZER)
}

fn current_status(service: &Service) -> LoadBalancerStatus {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.clone())
        .unwrap_or_default()
}

pub struct ServiceController {
    context: Arc<Context>,
}

impl ServiceController {
    pub fn new(client: Client, provider: Arc<Provider>) -> Self {
        Self {
            context: Arc::new(Context { client, provider }),
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!("Starting Service reconciliation");

        let services: Api<Service> = Api::all(self.context.client.clone());
        let controller = Controller::new(services, watcher::Config::default());

        let mut stream = controller
            .shutdown_on_signal()
            .run(reconcile, error_policy, self.context.clone())
            .boxed();

        while let Some(item) = stream.next().await {
            match item {
                Ok((svc, _)) => debug!(service = %svc, "Reconciled Service"),
                Err(e) => debug!(error = %e, "Service reconciliation stream error"),
            }
        }

        Ok(())
    }
}

async fn reconcile(service: Arc<Service>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);

    if !is_load_balancer(&service) {
        // Switched away from LoadBalancer: release what we created
        if has_finalizer(&service) && service.metadata.deletion_timestamp.is_none() {
            info!(service = %service.name_any(), %namespace, "Service is no longer a load balancer");
            ctx.provider.ensure_load_balancer_deleted(&service).await?;
            patch_status(&services, &service, &LoadBalancerStatus::default()).await?;
            remove_finalizer(&services, &service).await?;
        }
        return Ok(Action::await_change());
    }

    finalizer(&services, LOAD_BALANCER_FINALIZER, service, |event| async {
        match event {
            Event::Apply(svc) => apply(&services, &svc, &ctx).await,
            Event::Cleanup(svc) => cleanup(&svc, &ctx).await,
        }
    })
    .await
    .map_err(|e| ReconcileError::Finalizer(Box::new(e)))
}

async fn apply(services: &Api<Service>, service: &Service, ctx: &Context) -> Result<Action, ReconcileError> {
    info!(service = %service.name_any(), namespace = ?service.namespace(), "Reconciling Service");

    let nodes: Api<Node> = Api::all(ctx.client.clone());
    let nodes = nodes.list(&ListParams::default()).await?.items;
    let config = &ctx.provider.cloud().config;

    match ctx.provider.ensure_load_balancer(service, &nodes).await {
        Ok(status) => {
            info!(service = %service.name_any(), ingress = %status, "Load balancer ready");
            patch_status(services, service, &status.to_load_balancer_status()).await?;
            Ok(Action::requeue(RESYNC_INTERVAL))
        }
        Err(e) if e.is_not_ready() => {
            info!(service = %service.name_any(), "{}", e);
            Ok(Action::requeue(config.not_ready_requeue()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn cleanup(service: &Service, ctx: &Context) -> Result<Action, ReconcileError> {
    info!(service = %service.name_any(), namespace = ?service.namespace(), "Deleting load balancer");
    ctx.provider.ensure_load_balancer_deleted(service).await?;
    Ok(Action::await_change())
}

async fn patch_status(
    services: &Api<Service>,
    service: &Service,
    status: &LoadBalancerStatus,
) -> Result<(), ReconcileError> {
    if &current_status(service) == status {
        return Ok(());
    }
    let patch = json!({ "status": { "loadBalancer": status } });
    services
        .patch_status(&service.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn remove_finalizer(services: &Api<Service>, service: &Service) -> Result<(), ReconcileError> {
    let remaining: Vec<String> = service
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != LOAD_BALANCER_FINALIZER)
        .cloned()
        .collect();
    let patch = json!({
        "metadata": {
            "finalizers": remaining,
            "resourceVersion": service.resource_version(),
        }
    });
    services
        .patch(&service.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn error_policy(service: Arc<Service>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    error!(service = %service.name_any(), namespace = ?service.namespace(), %error, "Error reconciling Service");
    Action::requeue(ctx.provider.cloud().config.error_requeue())
}
