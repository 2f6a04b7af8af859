use anyhow::Result;
use ccm_cloud::Cloud;
use ccm_core::CloudConfig;
use ccm_lb::PrometheusMetrics;
use ccm_sdk::{OscClient, SystemResolver};
use kube::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod provider;
mod route_controller;
mod server;
mod service_controller;

use provider::Provider;
use route_controller::RouteController;
use service_controller::ServiceController;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting osc-ccm...");

    let config = CloudConfig::from_env()?;
    info!(cluster = %config.cluster_id, region = %config.region, "Configuration loaded");

    let api = Arc::new(OscClient::new(&config).await);
    let cloud = Cloud::new(api.clone(), api, Arc::new(SystemResolver), config);

    let metrics = PrometheusMetrics::new()?;
    let provider = Arc::new(Provider::new(cloud, Arc::new(metrics.clone())));

    let metrics_addr: SocketAddr = std::env::var(server::METRICS_ADDR_ENV)
        .unwrap_or_else(|_| server::DEFAULT_METRICS_ADDR.to_string())
        .parse()?;
    tokio::spawn(async move {
        if let Err(e) = server::serve(metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    let client = Client::try_default().await?;

    let services = ServiceController::new(client.clone(), provider.clone());
    tokio::spawn(async move {
        if let Err(e) = services.run().await {
            error!("Service controller error: {}", e);
        }
    });

    let routes = RouteController::new(client, provider.clone());
    tokio::spawn(async move {
        if let Err(e) = routes.run().await {
            error!("Route controller error: {}", e);
        }
    });

    tokio::spawn(sweep_security_groups(provider));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting...");

    Ok(())
}

/// Deletes the security groups left behind by deleted load balancers
async fn sweep_security_groups(provider: Arc<Provider>) {
    let interval = provider.cloud().config.sweep_interval();
    loop {
        tokio::time::sleep(interval).await;
        match provider.load_balancers().security().sweep().await {
            Ok(report) if report.deleted.is_empty() && report.pending.is_empty() => {}
            Ok(report) => info!(
                deleted = ?report.deleted,
                pending = ?report.pending,
                "Swept security groups"
            ),
            Err(e) => warn!(error = %e, "Security group sweep failed"),
        }
    }
}
