//! Cluster facade.
//!
//! Bundles the registry, runtime and recovery orchestrator behind one cheap
//! clonable handle. Bootstrap code and operator commands go through here;
//! the background loops are built from it.

use std::sync::Arc;
use std::time::Duration;

use fleetsim_id::{NodeId, PodId};
use fleetsim_reconcile::poll_until;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::health::{HealthMonitor, HealthMonitorConfig};
use crate::recovery::{
    EvictionCause, EvictionReport, RecoveryConfig, RecoveryOrchestrator, RecoveryOutcome,
};
use crate::registry::{Node, Pod, Registry, RegistryError};
use crate::runtime::{ContainerRuntime, RuntimeError, UnitHandle};
use crate::scheduler::{self, PlacementReport, ScheduleError, SchedulerWorker};

/// Errors from operator commands.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("failed to provision node: {0}")]
    ProvisionFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("node {0} is being recovered, try again later")]
    RecoveryInProgress(NodeId),
}

/// Result of stopping every node at shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub stopped: Vec<NodeId>,
    pub failed: Vec<NodeId>,
}

/// Shared cluster handle.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

struct ClusterInner {
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    recovery: Arc<RecoveryOrchestrator>,
    config: RecoveryConfig,
}

impl Cluster {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: RecoveryConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let recovery = Arc::new(RecoveryOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&runtime),
            config.clone(),
        ));
        Self {
            inner: Arc::new(ClusterInner {
                registry,
                runtime,
                recovery,
                config,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.inner.runtime
    }

    pub fn recovery(&self) -> &Arc<RecoveryOrchestrator> {
        &self.inner.recovery
    }

    /// Build the health monitor for this cluster.
    pub fn health_monitor(&self, config: HealthMonitorConfig) -> HealthMonitor {
        HealthMonitor::new(
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.runtime),
            Arc::clone(&self.inner.recovery),
            config,
        )
    }

    /// Build the pending-pod scheduler worker for this cluster.
    pub fn scheduler_worker(&self, interval: Duration) -> SchedulerWorker {
        SchedulerWorker::new(
            Arc::clone(&self.inner.registry),
            self.inner.config.strategy,
            interval,
        )
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Create and start a unit, wait for it to run, then track it as a node.
    ///
    /// If the unit never comes up it is removed and nothing is registered.
    #[instrument(skip(self))]
    pub async fn provision_node(&self, cpus: u32) -> Result<NodeId, ClusterError> {
        if cpus == 0 {
            return Err(ClusterError::InvalidRequest(
                "node must have at least one CPU".to_string(),
            ));
        }

        let runtime = &self.inner.runtime;
        let unit = runtime.create(cpus).await?;

        let ready = match runtime.start(&unit).await {
            Ok(()) => self
                .wait_running(&unit)
                .await
                .map_err(|e| ClusterError::ProvisionFailed(e.to_string())),
            Err(e) => Err(ClusterError::ProvisionFailed(e.to_string())),
        };
        if let Err(e) = ready {
            warn!(unit = %unit, error = %e, "Unit did not start, removing");
            if let Err(remove_err) = runtime.remove(&unit, true).await {
                warn!(unit = %unit, error = %remove_err, "Failed to remove unit");
            }
            return Err(e);
        }

        let id = NodeId::new();
        self.inner
            .registry
            .add_node(Node::new(id, unit.clone(), cpus))
            .await?;

        info!(node_id = %id, unit = %unit, cpus, "Node provisioned");
        Ok(id)
    }

    async fn wait_running(&self, unit: &UnitHandle) -> Result<(), fleetsim_reconcile::ReconcileError> {
        let runtime = &self.inner.runtime;
        poll_until(
            unit.as_str(),
            &self.inner.config.backoff,
            self.inner.config.verify_timeout,
            || async move {
                match runtime.inspect(unit).await {
                    Ok(state) if state.running => Some(()),
                    _ => None,
                }
            },
        )
        .await
    }

    /// Restart a node through the recovery orchestrator.
    ///
    /// Lifts an earlier operator stop, so a stopped node comes back.
    pub async fn restart_node(&self, id: &NodeId) -> Result<RecoveryOutcome, ClusterError> {
        if self.inner.registry.clear_operator_stop(id).await? {
            info!(node_id = %id, "Lifting operator stop");
        }
        Ok(self.inner.recovery.restart_node(id).await?)
    }

    /// Stop a node on purpose. The health monitor will not restart it, even
    /// if the unit reports a failed exit afterwards.
    ///
    /// Refused while a recovery runs on the node.
    #[instrument(skip(self), fields(node_id = %id))]
    pub async fn stop_node(&self, id: &NodeId) -> Result<(), ClusterError> {
        let Some(_claim) = self.inner.recovery.claim(id) else {
            return Err(ClusterError::RecoveryInProgress(*id));
        };
        let unit = self.inner.registry.node(id).await?.unit;

        let state = self.inner.runtime.inspect(&unit).await?;
        if state.running {
            self.inner.runtime.stop(&unit).await?;
            info!(node_id = %id, "Node stopped");
        } else {
            info!(node_id = %id, "Node already stopped");
        }

        self.inner.registry.mark_operator_stopped(id).await?;
        Ok(())
    }

    /// Stop and remove a node's unit, then re-place its pods.
    #[instrument(skip(self), fields(node_id = %id))]
    pub async fn decommission_node(&self, id: &NodeId) -> Result<EvictionReport, ClusterError> {
        let unit = self.inner.registry.node(id).await?.unit;
        let runtime = &self.inner.runtime;

        if let Err(e) = runtime.stop(&unit).await {
            warn!(node_id = %id, error = %e, "Stop failed, forcing removal");
        }
        match runtime.remove(&unit, true).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let report = self
            .inner
            .recovery
            .evict_and_reschedule(id, EvictionCause::Decommissioned)
            .await?;
        Ok(report)
    }

    /// Stop every tracked node's unit. Failures are logged and skipped.
    pub async fn shutdown_all(&self) -> ShutdownSummary {
        info!("Stopping all nodes");
        let mut summary = ShutdownSummary::default();

        for node in self.inner.registry.nodes_snapshot().await {
            match self.inner.runtime.stop(&node.unit).await {
                Ok(()) => {
                    info!(node_id = %node.id, "Node stopped");
                    // Node may have been evicted concurrently
                    let _ = self.inner.registry.mark_operator_stopped(&node.id).await;
                    summary.stopped.push(node.id);
                }
                Err(e) => {
                    warn!(node_id = %node.id, error = %e, "Failed to stop node");
                    summary.failed.push(node.id);
                }
            }
        }

        info!(
            stopped = summary.stopped.len(),
            failed = summary.failed.len(),
            "All nodes processed"
        );
        summary
    }

    // =========================================================================
    // Pods
    // =========================================================================

    /// Track a new pod as `Pending`.
    pub async fn submit_pod(&self, cpu_request: u32) -> Result<PodId, ClusterError> {
        if cpu_request == 0 {
            return Err(ClusterError::InvalidRequest(
                "pod must request at least one CPU".to_string(),
            ));
        }
        let id = PodId::new();
        self.inner.registry.add_pod(Pod::new(id, cpu_request)).await?;
        info!(pod_id = %id, cpu_request, "Pod submitted");
        Ok(id)
    }

    /// Place one pending pod now.
    ///
    /// On `NoCapacity` the registry is left untouched.
    pub async fn schedule_pod(&self, pod_id: &PodId) -> Result<NodeId, ClusterError> {
        let strategy = self.inner.config.strategy;
        let node_id = self
            .inner
            .registry
            .transact(|state| -> Result<NodeId, ClusterError> {
                let pod = state.pod(pod_id)?.clone();
                if let Some(node_id) = pod.node_id {
                    return Ok(node_id);
                }
                let node_id = scheduler::schedule_pod(&pod, state.nodes(), strategy)?;
                state.assign_pod(pod_id, &node_id)?;
                Ok(node_id)
            })
            .await?;
        info!(pod_id = %pod_id, node_id = %node_id, "Pod scheduled");
        Ok(node_id)
    }

    /// Place every pending pod.
    pub async fn schedule_pending(&self) -> PlacementReport {
        let strategy = self.inner.config.strategy;
        self.inner
            .registry
            .transact(|state| scheduler::place_pending(state, strategy))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeStatus;
    use crate::runtime::{MockRuntime, StartBehavior};
    use fleetsim_reconcile::BackoffPolicy;

    fn cluster() -> (Cluster, Arc<MockRuntime>) {
        cluster_with(MockRuntime::new())
    }

    fn cluster_with(runtime: MockRuntime) -> (Cluster, Arc<MockRuntime>) {
        let runtime = Arc::new(runtime);
        let config = RecoveryConfig {
            restart_settle: Duration::ZERO,
            verify_timeout: Duration::from_millis(30),
            backoff: BackoffPolicy::fixed(Duration::from_millis(5), Duration::from_millis(5)),
            ..RecoveryConfig::default()
        };
        let cluster = Cluster::new(runtime.clone() as Arc<dyn ContainerRuntime>, config);
        (cluster, runtime)
    }

    #[tokio::test]
    async fn test_provision_node_registers_running_node() {
        let (cluster, runtime) = cluster();

        let id = cluster.provision_node(4).await.unwrap();

        let node = cluster.registry().node(&id).await.unwrap();
        assert_eq!(node.total_capacity, 4);
        assert_eq!(node.status, NodeStatus::Running);
        assert!(runtime.is_running(&node.unit).await);
        assert_eq!(cluster.registry().capacity_pool().await, 4);
    }

    #[tokio::test]
    async fn test_provision_rejects_zero_cpus() {
        let (cluster, runtime) = cluster();
        assert!(matches!(
            cluster.provision_node(0).await,
            Err(ClusterError::InvalidRequest(_))
        ));
        assert_eq!(runtime.unit_count().await, 0);
    }

    #[tokio::test]
    async fn test_provision_runtime_down() {
        let (cluster, runtime) = cluster();
        runtime.set_unavailable(true);

        assert!(matches!(
            cluster.provision_node(2).await,
            Err(ClusterError::Runtime(RuntimeError::Unavailable(_)))
        ));
        assert!(cluster.registry().nodes_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_submit_and_schedule_pod() {
        let (cluster, _) = cluster();
        let node = cluster.provision_node(2).await.unwrap();
        let pod = cluster.submit_pod(2).await.unwrap();

        assert!(cluster.registry().pod(&pod).await.unwrap().is_pending());
        assert_eq!(cluster.schedule_pod(&pod).await.unwrap(), node);
        // Already placed
        assert_eq!(cluster.schedule_pod(&pod).await.unwrap(), node);
    }

    #[tokio::test]
    async fn test_schedule_pod_without_capacity() {
        let (cluster, _) = cluster();
        cluster.provision_node(1).await.unwrap();
        let pod = cluster.submit_pod(2).await.unwrap();

        let err = cluster.schedule_pod(&pod).await.unwrap_err();
        assert!(matches!(
            err,
            ClusterError::Schedule(ScheduleError::NoCapacity { cpu_request: 2, .. })
        ));
        assert!(cluster.registry().pod(&pod).await.unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_stop_node_marks_stopped() {
        let (cluster, runtime) = cluster();
        let id = cluster.provision_node(2).await.unwrap();

        cluster.stop_node(&id).await.unwrap();
        // Stopping again only observes
        cluster.stop_node(&id).await.unwrap();

        let node = cluster.registry().node(&id).await.unwrap();
        assert_eq!(node.status, NodeStatus::Stopped);
        assert!(!runtime.is_running(&node.unit).await);
    }

    #[tokio::test]
    async fn test_stop_refused_while_recovering() {
        let (cluster, runtime) = cluster_with(MockRuntime::with_latency(Duration::from_millis(20)));
        let id = cluster.provision_node(2).await.unwrap();
        let unit = cluster.registry().node(&id).await.unwrap().unit;

        let restart = {
            let cluster = cluster.clone();
            tokio::spawn(async move { cluster.restart_node(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(
            cluster.stop_node(&id).await,
            Err(ClusterError::RecoveryInProgress(n)) if n == id
        ));
        assert!(matches!(
            restart.await.unwrap().unwrap(),
            RecoveryOutcome::Recovered
        ));

        cluster.stop_node(&id).await.unwrap();
        let node = cluster.registry().node(&id).await.unwrap();
        assert_eq!(node.status, NodeStatus::Stopped);
        assert!(node.operator_stopped);
        assert!(!runtime.is_running(&unit).await);
    }

    #[tokio::test]
    async fn test_restart_lifts_operator_stop() {
        let (cluster, runtime) = cluster();
        let id = cluster.provision_node(2).await.unwrap();
        cluster.stop_node(&id).await.unwrap();

        let outcome = cluster.restart_node(&id).await.unwrap();

        assert!(matches!(outcome, RecoveryOutcome::Recovered));
        let node = cluster.registry().node(&id).await.unwrap();
        assert_eq!(node.status, NodeStatus::Running);
        assert!(!node.operator_stopped);
        assert!(runtime.is_running(&node.unit).await);
    }

    #[tokio::test]
    async fn test_restart_unknown_node() {
        let (cluster, _) = cluster();
        assert!(matches!(
            cluster.restart_node(&NodeId::new()).await,
            Err(ClusterError::Registry(RegistryError::NodeNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_all_continues_past_failures() {
        let (cluster, runtime) = cluster();
        let a = cluster.provision_node(2).await.unwrap();
        let b = cluster.provision_node(2).await.unwrap();
        let unit_a = cluster.registry().node(&a).await.unwrap().unit;
        runtime.set_stop_failure(&unit_a, true).await;

        let summary = cluster.shutdown_all().await;

        assert_eq!(summary.failed, vec![a]);
        assert_eq!(summary.stopped, vec![b]);
        assert_eq!(cluster.registry().nodes_snapshot().await.len(), 2);
        let stopped = cluster.registry().node(&b).await.unwrap();
        assert_eq!(stopped.status, NodeStatus::Stopped);
        assert!(stopped.operator_stopped);
    }

    #[tokio::test]
    async fn test_provision_removes_unit_that_never_runs() {
        let runtime = Arc::new(StartFailingRuntime::default());
        let cluster = Cluster::new(
            runtime.clone() as Arc<dyn ContainerRuntime>,
            RecoveryConfig {
                verify_timeout: Duration::from_millis(20),
                backoff: BackoffPolicy::fixed(Duration::from_millis(5), Duration::from_millis(5)),
                ..RecoveryConfig::default()
            },
        );

        let err = cluster.provision_node(2).await.unwrap_err();

        assert!(matches!(err, ClusterError::ProvisionFailed(_)));
        assert_eq!(runtime.inner.unit_count().await, 0);
        assert!(cluster.registry().nodes_snapshot().await.is_empty());
    }

    /// Mock whose units exit as soon as they start.
    #[derive(Default)]
    struct StartFailingRuntime {
        inner: MockRuntime,
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for StartFailingRuntime {
        async fn create(&self, cpu_hint: u32) -> Result<UnitHandle, RuntimeError> {
            let unit = self.inner.create(cpu_hint).await?;
            self.inner
                .set_start_behavior(&unit, StartBehavior::ExitImmediately(1))
                .await;
            Ok(unit)
        }

        async fn start(&self, unit: &UnitHandle) -> Result<(), RuntimeError> {
            self.inner.start(unit).await
        }

        async fn stop(&self, unit: &UnitHandle) -> Result<(), RuntimeError> {
            self.inner.stop(unit).await
        }

        async fn remove(&self, unit: &UnitHandle, force: bool) -> Result<(), RuntimeError> {
            self.inner.remove(unit, force).await
        }

        async fn inspect(&self, unit: &UnitHandle) -> Result<crate::runtime::UnitState, RuntimeError> {
            self.inner.inspect(unit).await
        }
    }
}
