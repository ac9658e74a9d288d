//! fleetsim control plane
//!
//! Provisions the bootstrap nodes and pods, then keeps the cluster healthy:
//! the health monitor restarts or evicts failed nodes and the scheduler
//! worker keeps retrying pods that have no home. Runs until Ctrl+C, then
//! stops every node.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fleetsim_control_plane::{
    config::{self, RuntimeKind},
    runtime::{ContainerRuntime, DockerRuntime, MockRuntime},
    Cluster,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLEETSIM_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleetsim control plane");
    info!(
        runtime = ?config.runtime,
        nodes = ?config.bootstrap_nodes,
        pods = ?config.bootstrap_pods,
        "Configuration loaded"
    );

    let runtime: Arc<dyn ContainerRuntime> = match config.runtime {
        RuntimeKind::Mock => Arc::new(MockRuntime::new()),
        RuntimeKind::Docker => {
            info!(socket = %config.docker.socket_path, image = %config.docker.image, "Using Docker runtime");
            Arc::new(DockerRuntime::new(config.docker.clone()))
        }
    };
    let cluster = Cluster::new(runtime, config.recovery.clone());

    // Bootstrap nodes and pods
    for cpus in &config.bootstrap_nodes {
        if let Err(e) = cluster.provision_node(*cpus).await {
            error!(cpus, error = %e, "Failed to provision bootstrap node");
        }
    }
    for cpus in &config.bootstrap_pods {
        if let Err(e) = cluster.submit_pod(*cpus).await {
            error!(cpus, error = %e, "Failed to submit bootstrap pod");
        }
    }
    let placement = cluster.schedule_pending().await;
    info!(
        placed = placement.placed.len(),
        pending = placement.unplaced.len(),
        "Initial placement complete"
    );

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start health monitor in background
    let monitor = cluster.health_monitor(config.health.clone());
    let mut monitor_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { monitor.run(shutdown_rx).await }
    });

    // Start scheduler worker in background
    let scheduler_worker = cluster.scheduler_worker(config.schedule_interval);
    let scheduler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            scheduler_worker.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal (Ctrl+C) or a fatal monitor exit
    let mut fatal = None;
    let mut monitor_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut monitor_handle => {
            monitor_done = true;
            match result {
                Ok(Ok(())) => warn!("Health monitor exited unexpectedly"),
                Ok(Err(e)) => {
                    error!(error = %e, "Health monitor stopped on corrupt registry state");
                    fatal = Some(anyhow::Error::new(e));
                }
                Err(e) => error!(error = %e, "Health monitor task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Wait for workers to finish
    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(30);

    if !monitor_done {
        match tokio::time::timeout(shutdown_timeout, monitor_handle).await {
            Ok(Ok(Err(e))) => {
                error!(error = %e, "Health monitor stopped on corrupt registry state");
                fatal = Some(anyhow::Error::new(e));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Health monitor did not shut down in time"),
        }
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, scheduler_handle).await {
        warn!(error = %e, "Scheduler worker did not shut down in time");
    }

    let summary = cluster.shutdown_all().await;
    if !summary.failed.is_empty() {
        warn!(failed = summary.failed.len(), "Some nodes could not be stopped");
    }

    info!("Control plane shutdown complete");
    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
