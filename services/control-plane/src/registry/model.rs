//! Node and pod records.

use chrono::{DateTime, Utc};
use fleetsim_id::{NodeId, PodId};
use serde::{Deserialize, Serialize};

use crate::runtime::UnitHandle;

/// Node status as last observed by the health monitor or set by recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    Running,
    /// Exited cleanly or stopped by an operator. Never auto-restarted.
    Stopped,
    Unhealthy,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Unhealthy => "Unhealthy",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodStatus {
    /// Not bound to any node.
    Pending,
    Running,
}

/// A tracked worker unit with a CPU budget.
///
/// Values handed out by the registry are copies; only the registry mutates
/// the authoritative record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub unit: UnitHandle,
    pub total_capacity: u32,
    pub used_capacity: u32,
    pub status: NodeStatus,
    /// Set when an operator stopped the node. The health monitor never
    /// triggers a recovery for it; cleared once the node runs again.
    #[serde(default)]
    pub operator_stopped: bool,
    pub pod_ids: Vec<PodId>,
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// A freshly provisioned, running node with nothing assigned.
    pub fn new(id: NodeId, unit: UnitHandle, total_capacity: u32) -> Self {
        Self {
            id,
            unit,
            total_capacity,
            used_capacity: 0,
            status: NodeStatus::Running,
            operator_stopped: false,
            pod_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// CPU units still available for placement.
    pub fn idle_capacity(&self) -> u32 {
        self.total_capacity.saturating_sub(self.used_capacity)
    }

    pub fn is_schedulable(&self) -> bool {
        self.status == NodeStatus::Running
    }
}

/// A schedulable workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub id: PodId,
    pub cpu_request: u32,
    pub node_id: Option<NodeId>,
    pub status: PodStatus,
    pub submitted_at: DateTime<Utc>,
}

impl Pod {
    /// A new, unscheduled pod.
    pub fn new(id: PodId, cpu_request: u32) -> Self {
        Self {
            id,
            cpu_request,
            node_id: None,
            status: PodStatus::Pending,
            submitted_at: Utc::now(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.node_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_node_is_running_and_empty() {
        let node = Node::new(NodeId::new(), UnitHandle::new("u"), 4);
        assert_eq!(node.status, NodeStatus::Running);
        assert!(!node.operator_stopped);
        assert_eq!(node.idle_capacity(), 4);
        assert!(node.pod_ids.is_empty());
    }

    #[test]
    fn test_new_pod_is_pending() {
        let pod = Pod::new(PodId::new(), 2);
        assert!(pod.is_pending());
        assert_eq!(pod.status, PodStatus::Pending);
    }

    #[test]
    fn test_node_status_serialization() {
        let json = serde_json::to_string(&NodeStatus::Unhealthy).unwrap();
        assert_eq!(json, "\"Unhealthy\"");
    }
}
