//! Node and pod registry.
//!
//! The registry is the single owner of node and pod records. All state sits
//! behind one async mutex; every public operation takes it once and runs a
//! synchronous closure over [`RegistryState`]. Because closures are
//! synchronous, no caller can hold the lock across a runtime call.
//!
//! Compound updates (evict then re-place, assign a batch) go through
//! [`Registry::transact`] so they commit as one critical section.

use fleetsim_id::{NodeId, PodId};
use thiserror::Error;
use tokio::sync::Mutex;

mod model;
mod state;

pub use model::{Node, NodeStatus, Pod, PodStatus};
pub use state::RegistryState;

/// Registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate id: {0}")]
    DuplicateId(String),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("pod not found: {0}")]
    PodNotFound(PodId),

    #[error("pod {pod} is already assigned to node {node}")]
    PodAlreadyAssigned { pod: PodId, node: NodeId },

    #[error("node {node} has {idle} idle CPUs but pod {pod} requests {requested}")]
    InsufficientCapacity {
        node: NodeId,
        pod: PodId,
        requested: u32,
        idle: u32,
    },

    #[error("capacity accounting diverged on node {node}: recorded {recorded}, assigned pods sum to {computed}")]
    AccountingDiverged {
        node: NodeId,
        recorded: u32,
        computed: u64,
    },

    #[error("node {node} is over capacity: {used} of {total} CPUs used")]
    CapacityExceeded { node: NodeId, used: u32, total: u32 },

    #[error("pod {pod} and node {node} disagree on assignment")]
    AssignmentMismatch { pod: PodId, node: NodeId },
}

impl RegistryError {
    /// Whether the error means the registry state is corrupt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AccountingDiverged { .. }
                | Self::CapacityExceeded { .. }
                | Self::AssignmentMismatch { .. }
        )
    }
}

/// Shared handle over the registry state.
#[derive(Debug, Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access to the state.
    pub async fn transact<R>(&self, f: impl FnOnce(&mut RegistryState) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    /// Run `f` with read access to the state.
    pub async fn read<R>(&self, f: impl FnOnce(&RegistryState) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }

    pub async fn add_node(&self, node: Node) -> Result<(), RegistryError> {
        self.transact(|s| s.add_node(node)).await
    }

    pub async fn add_pod(&self, pod: Pod) -> Result<(), RegistryError> {
        self.transact(|s| s.add_pod(pod)).await
    }

    /// Copy of a node record.
    pub async fn node(&self, id: &NodeId) -> Result<Node, RegistryError> {
        self.read(|s| s.node(id).cloned()).await
    }

    /// Copy of a pod record.
    pub async fn pod(&self, id: &PodId) -> Result<Pod, RegistryError> {
        self.read(|s| s.pod(id).cloned()).await
    }

    /// Copies of every node, ascending by id.
    pub async fn nodes_snapshot(&self) -> Vec<Node> {
        self.read(RegistryState::nodes_snapshot).await
    }

    /// Copies of every pod, ascending by id.
    pub async fn pods_snapshot(&self) -> Vec<Pod> {
        self.read(RegistryState::pods_snapshot).await
    }

    pub async fn assign_pod(&self, pod_id: &PodId, node_id: &NodeId) -> Result<(), RegistryError> {
        self.transact(|s| s.assign_pod(pod_id, node_id)).await
    }

    pub async fn unassign_pod(&self, pod_id: &PodId) -> Result<Option<NodeId>, RegistryError> {
        self.transact(|s| s.unassign_pod(pod_id)).await
    }

    pub async fn remove_node(&self, id: &NodeId) -> Result<Node, RegistryError> {
        self.transact(|s| s.remove_node(id)).await
    }

    pub async fn set_node_status(
        &self,
        id: &NodeId,
        status: NodeStatus,
    ) -> Result<NodeStatus, RegistryError> {
        self.transact(|s| s.set_node_status(id, status)).await
    }

    pub async fn mark_operator_stopped(&self, id: &NodeId) -> Result<NodeStatus, RegistryError> {
        self.transact(|s| s.mark_operator_stopped(id)).await
    }

    pub async fn clear_operator_stop(&self, id: &NodeId) -> Result<bool, RegistryError> {
        self.transact(|s| s.clear_operator_stop(id)).await
    }

    pub async fn compare_and_set_status(
        &self,
        id: &NodeId,
        expected: NodeStatus,
        status: NodeStatus,
    ) -> Result<bool, RegistryError> {
        self.transact(|s| s.compare_and_set_status(id, expected, status))
            .await
    }

    pub async fn pending_pods(&self) -> Vec<PodId> {
        self.read(RegistryState::pending_pods).await
    }

    pub async fn capacity_pool(&self) -> u64 {
        self.read(RegistryState::capacity_pool).await
    }

    pub async fn verify_accounting(&self) -> Result<(), RegistryError> {
        self.read(RegistryState::verify_accounting).await
    }
}
