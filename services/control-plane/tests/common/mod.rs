//! Shared harness for control plane integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fleetsim_control_plane::health::HealthMonitorConfig;
use fleetsim_control_plane::recovery::RecoveryConfig;
use fleetsim_control_plane::registry::{Node, Pod};
use fleetsim_control_plane::runtime::{ContainerRuntime, MockRuntime, UnitHandle};
use fleetsim_control_plane::scheduler::Strategy;
use fleetsim_control_plane::Cluster;
use fleetsim_id::{NodeId, PodId};
use fleetsim_reconcile::BackoffPolicy;

pub struct Harness {
    pub cluster: Cluster,
    pub runtime: Arc<MockRuntime>,
}

impl Harness {
    pub fn new() -> Self {
        let runtime = Arc::new(MockRuntime::new());
        let cluster = Cluster::new(
            runtime.clone() as Arc<dyn ContainerRuntime>,
            recovery_config(),
        );
        Self { cluster, runtime }
    }

    /// Track a running node with a predictable id (`n` orders nodes).
    pub async fn node(&self, n: u64, cpus: u32) -> (NodeId, UnitHandle) {
        let unit = self.runtime.create(cpus).await.unwrap();
        self.runtime.start(&unit).await.unwrap();
        let id = NodeId::from_parts(n, 0);
        self.cluster
            .registry()
            .add_node(Node::new(id, unit.clone(), cpus))
            .await
            .unwrap();
        (id, unit)
    }

    /// Track a pending pod with a predictable id.
    pub async fn pod(&self, n: u64, cpus: u32) -> PodId {
        let id = PodId::from_parts(n, 0);
        self.cluster
            .registry()
            .add_pod(Pod::new(id, cpus))
            .await
            .unwrap();
        id
    }

    pub async fn placed_pod(&self, n: u64, cpus: u32) -> PodId {
        let id = self.pod(n, cpus).await;
        self.cluster.schedule_pod(&id).await.unwrap();
        id
    }
}

pub fn recovery_config() -> RecoveryConfig {
    RecoveryConfig {
        restart_settle: Duration::ZERO,
        verify_timeout: Duration::from_millis(40),
        backoff: BackoffPolicy::fixed(Duration::from_millis(5), Duration::from_millis(10)),
        strategy: Strategy::FirstFit,
    }
}

pub fn monitor_config() -> HealthMonitorConfig {
    HealthMonitorConfig {
        interval: Duration::from_millis(10),
        inspect_timeout: Duration::from_millis(100),
        unreachable_threshold: None,
    }
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check().await
}
