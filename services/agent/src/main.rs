//! stratus reconciliation agent
//!
//! Converges the sub-resource collections (disks, network adapters, tags,
//! firewall rules) of the servers and network domains declared in a
//! manifest against the cloud control plane.
//!
//! ## Architecture
//!
//! - **Reconciler**: runs a round per interval, one task per owner
//! - **Orchestrator**: runs a serialized pass per owner and kind
//! - **Control plane**: HTTP client in production, in-memory mock in dev

use std::sync::Arc;

use anyhow::Result;
use stratus_agent::{Config, HttpControlPlane, Manifest, Reconciler};
use stratus_reconcile::mock::MockControlPlane;
use stratus_reconcile::{ControlPlane, LockRegistry, Orchestrator, ShutdownSignal};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting stratus agent");
    info!(
        api_url = %config.api_url,
        manifest = %config.manifest_path.display(),
        allow_owner_reboot = config.engine.allow_owner_reboot,
        once = config.once,
        "Configuration loaded"
    );

    let manifest = Manifest::load(&config.manifest_path)?;
    info!(owners = manifest.owner_count(), "Manifest loaded");

    if config.uses_mock() {
        let plane = MockControlPlane::new();
        for server in &manifest.servers {
            plane.add_server(&server.id, false);
        }
        for domain in &manifest.network_domains {
            plane.add_network_domain(&domain.id);
        }
        info!("Using in-memory control plane");
        run(config, manifest, Arc::new(plane)).await
    } else {
        let plane = HttpControlPlane::new(&config)?;
        run(config, manifest, Arc::new(plane)).await
    }
}

async fn run<A: ControlPlane + 'static>(
    config: Config,
    manifest: Manifest,
    api: Arc<A>,
) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine = Orchestrator::new(
        api,
        LockRegistry::new(),
        config.engine.clone(),
        ShutdownSignal::new(shutdown_rx.clone()),
    );
    let reconciler = Reconciler::new(engine, manifest, config.reconcile_interval);

    if config.once {
        let summary = reconciler.run_once().await;
        if summary.failed > 0 {
            anyhow::bail!("{} reconciliation pass(es) failed", summary.failed);
        }
        return Ok(());
    }

    let mut reconciler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut reconciler_handle => {
            if let Err(e) = result {
                error!(error = %e, "Reconciler task panicked");
            }
            info!("Reconciler exited");
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for in-flight passes to stop...");
    if let Err(e) = reconciler_handle.await {
        error!(error = %e, "Reconciler task panicked");
    }

    info!("Agent shutdown complete");
    Ok(())
}
