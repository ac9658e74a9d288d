//! Health monitor loop.

use std::sync::Arc;
use std::time::Duration;

use fleetsim_id::NodeId;
use fleetsim_reconcile::FailureStreaks;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::transition::{evaluate, HealthAction, Observation};
use crate::recovery::{RecoveryOrchestrator, RecoveryOutcome};
use crate::registry::{Node, NodeStatus, Registry, RegistryError};
use crate::runtime::ContainerRuntime;

/// Health monitor configuration.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Interval between polls of every node.
    pub interval: Duration,

    /// Upper bound for one inspect call. Exceeding it counts as unreachable.
    pub inspect_timeout: Duration,

    /// Consecutive unreachable polls after which a recovery is triggered.
    /// `None` never escalates.
    pub unreachable_threshold: Option<u32>,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            inspect_timeout: Duration::from_secs(5),
            unreachable_threshold: None,
        }
    }
}

/// A committed status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub node_id: NodeId,
    pub from: NodeStatus,
    pub to: NodeStatus,
}

/// Result of one pass over all nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Nodes inspected; nodes under recovery are not.
    pub checked: usize,
    pub changes: Vec<StatusChange>,
    /// Nodes handed to recovery, ascending by id.
    pub triggered: Vec<NodeId>,
    /// Nodes whose result was dropped because their status moved meanwhile.
    pub stale: Vec<NodeId>,
}

type RecoveryResult = (NodeId, Result<RecoveryOutcome, RegistryError>);

/// Polls node units and drives status transitions and recoveries.
pub struct HealthMonitor {
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    recovery: Arc<RecoveryOrchestrator>,
    config: HealthMonitorConfig,
    streaks: Mutex<FailureStreaks<NodeId>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        recovery: Arc<RecoveryOrchestrator>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            registry,
            runtime,
            recovery,
            config,
            streaks: Mutex::new(FailureStreaks::new()),
        }
    }

    /// Run until shutdown is signaled.
    ///
    /// Recoveries triggered by a pass run as separate tasks. On shutdown the
    /// loop stops polling and waits for them to finish. Returns an error only
    /// when registry accounting is found corrupt.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), RegistryError> {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            inspect_timeout_ms = self.config.inspect_timeout.as_millis() as u64,
            unreachable_threshold = ?self.config.unreachable_threshold,
            "Starting health monitor"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick
        interval.tick().await;

        let mut recoveries: JoinSet<RecoveryResult> = JoinSet::new();

        let mut result = loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.check_once().await {
                        Ok(report) => {
                            for node_id in report.triggered {
                                let recovery = Arc::clone(&self.recovery);
                                recoveries.spawn(async move {
                                    let outcome = recovery.restart_node(&node_id).await;
                                    (node_id, outcome)
                                });
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Registry accounting check failed");
                            break Err(e);
                        }
                    }
                }
                Some(joined) = recoveries.join_next(), if !recoveries.is_empty() => {
                    if let Err(e) = Self::settle(joined) {
                        break Err(e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Health monitor shutting down");
                        break Ok(());
                    }
                }
            }
        };

        if !recoveries.is_empty() {
            info!(in_flight = recoveries.len(), "Waiting for in-flight recoveries");
        }
        while let Some(joined) = recoveries.join_next().await {
            if let Err(e) = Self::settle(joined) {
                result = result.and(Err(e));
            }
        }
        result
    }

    /// Log a finished recovery. Passes fatal registry errors through.
    fn settle(joined: Result<RecoveryResult, tokio::task::JoinError>) -> Result<(), RegistryError> {
        let (node_id, outcome) = match joined {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Recovery task panicked");
                return Ok(());
            }
        };

        match outcome {
            Ok(RecoveryOutcome::Recovered) => info!(node_id = %node_id, "Node recovered"),
            Ok(RecoveryOutcome::Evicted(report)) => info!(
                node_id = %node_id,
                rescheduled = report.rescheduled.len(),
                unplaced = report.unplaced.len(),
                "Node evicted"
            ),
            Ok(RecoveryOutcome::NodeGone) => debug!(node_id = %node_id, "Node gone before recovery finished"),
            Ok(RecoveryOutcome::AlreadyInProgress) => debug!(node_id = %node_id, "Recovery already running"),
            Ok(RecoveryOutcome::OperatorStopped) => info!(node_id = %node_id, "Node left stopped by operator"),
            Err(e) if e.is_fatal() => {
                error!(node_id = %node_id, error = %e, "Recovery broke registry accounting");
                return Err(e);
            }
            Err(e) => warn!(node_id = %node_id, error = %e, "Recovery aborted"),
        }
        Ok(())
    }

    /// Poll every node once and commit the results.
    ///
    /// Nodes under recovery are skipped; the recovery owns their status
    /// until it ends. Returns the nodes that need recovery; the caller
    /// decides how to run them. Fails only if accounting verification fails
    /// after the pass.
    #[instrument(skip(self))]
    pub async fn check_once(&self) -> Result<PassReport, RegistryError> {
        let nodes = self.registry.nodes_snapshot().await;
        let mut report = PassReport::default();

        for node in &nodes {
            if self.recovery.is_in_flight(&node.id) {
                debug!(node_id = %node.id, "Recovery in flight, skipping");
                continue;
            }
            report.checked += 1;

            let observation = self.observe(node).await;
            let transition = evaluate(node.status, observation);

            let committed = self
                .registry
                .compare_and_set_status(&node.id, node.status, transition.status)
                .await;
            match committed {
                Ok(true) => {}
                Ok(false) | Err(RegistryError::NodeNotFound(_)) => {
                    debug!(node_id = %node.id, "Node changed during health check, dropping result");
                    report.stale.push(node.id);
                    continue;
                }
                Err(e) => return Err(e),
            }

            let mut action = if observation == Observation::Unreachable {
                self.escalate(node).await
            } else {
                self.streaks.lock().await.clear(&node.id);
                transition.action
            };
            if action == HealthAction::Recover && node.operator_stopped {
                debug!(node_id = %node.id, "Node stopped by operator, not recovering");
                action = HealthAction::None;
            }

            if node.status != transition.status {
                info!(
                    node_id = %node.id,
                    from = %node.status,
                    to = %transition.status,
                    "Node status changed"
                );
                report.changes.push(StatusChange {
                    node_id: node.id,
                    from: node.status,
                    to: transition.status,
                });
            }

            if action == HealthAction::Recover {
                report.triggered.push(node.id);
            }
        }

        {
            let live: Vec<NodeId> = nodes.iter().map(|n| n.id).collect();
            self.streaks
                .lock()
                .await
                .retain(|id| live.binary_search(id).is_ok());
        }

        self.registry.verify_accounting().await?;
        Ok(report)
    }

    /// Inspect a node's unit, bounded by the inspect timeout.
    async fn observe(&self, node: &Node) -> Observation {
        let inspect = self.runtime.inspect(&node.unit);
        match tokio::time::timeout(self.config.inspect_timeout, inspect).await {
            Ok(Ok(state)) => {
                debug!(node_id = %node.id, running = state.running, exit_code = state.exit_code, "Inspected node");
                state.into()
            }
            Ok(Err(e)) => {
                warn!(node_id = %node.id, unit = %node.unit, error = %e, "Failed to inspect node");
                Observation::Unreachable
            }
            Err(_) => {
                warn!(node_id = %node.id, unit = %node.unit, "Inspect timed out");
                Observation::Unreachable
            }
        }
    }

    /// Count an unreachable poll; decide whether it escalates to recovery.
    async fn escalate(&self, node: &Node) -> HealthAction {
        let Some(threshold) = self.config.unreachable_threshold else {
            return HealthAction::None;
        };

        let mut streaks = self.streaks.lock().await;
        let streak = streaks.record_failure(&node.id);
        if streak < threshold || node.status == NodeStatus::Stopped || node.operator_stopped {
            return HealthAction::None;
        }

        warn!(node_id = %node.id, streak, "Node unreachable, escalating to recovery");
        streaks.clear(&node.id);
        HealthAction::Recover
    }
}
