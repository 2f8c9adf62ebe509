//! Reconciliation loop for the declared owners.
//!
//! The reconciler:
//! - Runs one round per interval (or a single round in `once` mode)
//! - Reconciles every owner concurrently, one task per owner
//! - Runs the passes of an owner sequentially, one per sub-resource kind
//! - Logs failed passes; the next round re-diffs from the observed state

use std::sync::Arc;
use std::time::Duration;

use stratus_reconcile::kinds::{Disk, FirewallRule, NetworkAdapter, Tag};
use stratus_reconcile::{ControlPlane, Orchestrator, Owner, PassOutcome, SubResource};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::manifest::Manifest;

/// Tally of one reconciliation round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundSummary {
    /// Passes run.
    pub passes: usize,

    /// Actions applied across all passes.
    pub applied: usize,

    /// Passes that aborted with an error.
    pub failed: usize,

    /// Passes skipped because the owner no longer exists.
    pub owners_deleted: usize,
}

impl RoundSummary {
    fn merge(&mut self, other: RoundSummary) {
        self.passes += other.passes;
        self.applied += other.applied;
        self.failed += other.failed;
        self.owners_deleted += other.owners_deleted;
    }

    fn record<K: SubResource>(
        &mut self,
        owner: &Owner,
        result: stratus_reconcile::ReconcileResult<PassOutcome<K>>,
    ) {
        self.passes += 1;
        match result {
            Ok(PassOutcome::Converged { applied, .. }) => {
                self.applied += applied.len();
                debug!(owner = %owner, kind = K::NAME, applied = applied.len(), "Pass converged");
            }
            Ok(PassOutcome::OwnerDeleted { .. }) => {
                self.owners_deleted += 1;
                warn!(owner = %owner, kind = K::NAME, "Owner no longer exists");
            }
            Err(e) => {
                self.failed += 1;
                error!(owner = %owner, kind = K::NAME, error = %e, "Reconciliation pass failed");
            }
        }
    }
}

/// Drives reconciliation rounds for a manifest.
pub struct Reconciler<A> {
    engine: Orchestrator<A>,
    manifest: Arc<Manifest>,
    interval: Duration,
}

impl<A: ControlPlane + 'static> Reconciler<A> {
    pub fn new(engine: Orchestrator<A>, manifest: Manifest, interval: Duration) -> Self {
        Self {
            engine,
            manifest: Arc::new(manifest),
            interval,
        }
    }

    /// Run rounds until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reconcile_interval_secs = self.interval.as_secs(),
            owners = self.manifest.owner_count(),
            "Starting reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let summary = self.run_once().await;
                    if summary.failed > 0 {
                        warn!(failed = summary.failed, "Round finished with failed passes, will retry");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single round over every owner.
    pub async fn run_once(&self) -> RoundSummary {
        let mut tasks = JoinSet::new();

        for server in &self.manifest.servers {
            let engine = self.engine.clone();
            let server = server.clone();
            tasks.spawn(async move {
                let owner = server.owner();
                let mut summary = RoundSummary::default();
                summary.record(&owner, engine.reconcile::<Disk>(&owner, &server.disks).await);
                summary.record(
                    &owner,
                    engine
                        .reconcile::<NetworkAdapter>(&owner, &server.network_adapters)
                        .await,
                );
                summary.record(&owner, engine.reconcile::<Tag>(&owner, &server.tags()).await);
                summary
            });
        }

        for domain in &self.manifest.network_domains {
            let engine = self.engine.clone();
            let domain = domain.clone();
            tasks.spawn(async move {
                let owner = domain.owner();
                let mut summary = RoundSummary::default();
                summary.record(
                    &owner,
                    engine
                        .reconcile::<FirewallRule>(&owner, &domain.firewall_rules)
                        .await,
                );
                summary.record(&owner, engine.reconcile::<Tag>(&owner, &domain.tags()).await);
                summary
            });
        }

        let mut round = RoundSummary::default();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(summary) => round.merge(summary),
                Err(e) => {
                    round.failed += 1;
                    error!(error = %e, "Reconciliation task panicked");
                }
            }
        }

        info!(
            passes = round.passes,
            applied = round.applied,
            failed = round.failed,
            owners_deleted = round.owners_deleted,
            "Reconciliation round complete"
        );
        round
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_reconcile::mock::MockControlPlane;
    use stratus_reconcile::{EngineSettings, LockRegistry, ShutdownSignal};

    const MANIFEST: &str = r#"
[[server]]
id = "srv-1"
tags = { env = "prod" }

[[server.disk]]
scsi_unit_id = 0
size_gb = 10

[[network_domain]]
id = "nd-1"

[[network_domain.firewall_rule]]
name = "allow-ssh"
action = "ACCEPT"
protocol = "TCP"
destination_port = 22
"#;

    fn reconciler(plane: MockControlPlane) -> Reconciler<MockControlPlane> {
        let engine = Orchestrator::new(
            Arc::new(plane),
            LockRegistry::new(),
            EngineSettings::default(),
            ShutdownSignal::never(),
        );
        Reconciler::new(
            engine,
            Manifest::parse(MANIFEST).unwrap(),
            Duration::from_secs(60),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_converges_all_owners() {
        let plane = MockControlPlane::new();
        plane.add_server(&"srv-1".parse().unwrap(), false);
        plane.add_network_domain(&"nd-1".parse().unwrap());
        let reconciler = reconciler(plane);

        let first = reconciler.run_once().await;
        assert_eq!(first.passes, 5);
        assert_eq!(first.applied, 3);
        assert_eq!(first.failed, 0);

        let second = reconciler.run_once().await;
        assert_eq!(second.applied, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_owner_is_counted_not_failed() {
        let plane = MockControlPlane::new();
        plane.add_network_domain(&"nd-1".parse().unwrap());
        let reconciler = reconciler(plane);

        let summary = reconciler.run_once().await;
        assert_eq!(summary.owners_deleted, 3);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let plane = MockControlPlane::new();
        let reconciler = reconciler(plane);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { reconciler.run(shutdown_rx).await });
        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown_tx.send(true).unwrap();

        handle.await.unwrap();
    }
}
