//! Registry state and its lock-scoped operations.
//!
//! Every method here is synchronous and is only ever called while the
//! registry lock is held, so a method observes and leaves the maps in a
//! consistent state. Capacity accounting (`used_capacity`, `pod_ids`) is
//! mutated in exactly two places: [`RegistryState::assign_pod`] and
//! [`RegistryState::unassign_pod`].

use std::collections::BTreeMap;

use fleetsim_id::{NodeId, PodId};
use tracing::debug;

use super::model::{Node, NodeStatus, Pod, PodStatus};
use super::RegistryError;

/// Authoritative node and pod maps.
///
/// Ordered maps keep every iteration ascending by id.
#[derive(Debug, Default)]
pub struct RegistryState {
    nodes: BTreeMap<NodeId, Node>,
    pods: BTreeMap<PodId, Pod>,
    /// Total CPU units across tracked nodes.
    capacity_pool: u64,
}

impl RegistryState {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Track a new node and grow the capacity pool.
    pub fn add_node(&mut self, node: Node) -> Result<(), RegistryError> {
        if self.nodes.contains_key(&node.id) {
            return Err(RegistryError::DuplicateId(node.id.to_string()));
        }
        self.capacity_pool += u64::from(node.total_capacity);
        debug!(node_id = %node.id, cpus = node.total_capacity, "Node registered");
        self.nodes.insert(node.id, node);
        Ok(())
    }

    pub fn node(&self, id: &NodeId) -> Result<&Node, RegistryError> {
        self.nodes.get(id).ok_or(RegistryError::NodeNotFound(*id))
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Nodes in ascending id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn nodes_snapshot(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    /// Delete a node record and shrink the capacity pool.
    ///
    /// Pods are left untouched; the caller unassigns or re-places them in the
    /// same critical section.
    pub fn remove_node(&mut self, id: &NodeId) -> Result<Node, RegistryError> {
        let node = self
            .nodes
            .remove(id)
            .ok_or(RegistryError::NodeNotFound(*id))?;
        self.capacity_pool = self
            .capacity_pool
            .saturating_sub(u64::from(node.total_capacity));
        debug!(node_id = %id, "Node removed");
        Ok(node)
    }

    /// Set a node's status, returning the previous one.
    ///
    /// Moving to `Running` lifts an operator stop.
    pub fn set_node_status(
        &mut self,
        id: &NodeId,
        status: NodeStatus,
    ) -> Result<NodeStatus, RegistryError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or(RegistryError::NodeNotFound(*id))?;
        if status == NodeStatus::Running {
            node.operator_stopped = false;
        }
        Ok(std::mem::replace(&mut node.status, status))
    }

    /// Mark a node `Stopped` on an operator's behalf, returning the previous
    /// status.
    pub fn mark_operator_stopped(&mut self, id: &NodeId) -> Result<NodeStatus, RegistryError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or(RegistryError::NodeNotFound(*id))?;
        node.operator_stopped = true;
        Ok(std::mem::replace(&mut node.status, NodeStatus::Stopped))
    }

    /// Lift an operator stop without touching the status.
    ///
    /// Returns whether one was set.
    pub fn clear_operator_stop(&mut self, id: &NodeId) -> Result<bool, RegistryError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or(RegistryError::NodeNotFound(*id))?;
        Ok(std::mem::take(&mut node.operator_stopped))
    }

    /// Set a node's status only if it still equals `expected`.
    ///
    /// Returns whether the write happened.
    pub fn compare_and_set_status(
        &mut self,
        id: &NodeId,
        expected: NodeStatus,
        status: NodeStatus,
    ) -> Result<bool, RegistryError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or(RegistryError::NodeNotFound(*id))?;
        if node.status != expected {
            return Ok(false);
        }
        if status == NodeStatus::Running {
            node.operator_stopped = false;
        }
        node.status = status;
        Ok(true)
    }

    pub fn capacity_pool(&self) -> u64 {
        self.capacity_pool
    }

    // =========================================================================
    // Pods
    // =========================================================================

    /// Track a submitted pod. Pods always enter unscheduled.
    pub fn add_pod(&mut self, mut pod: Pod) -> Result<(), RegistryError> {
        if self.pods.contains_key(&pod.id) {
            return Err(RegistryError::DuplicateId(pod.id.to_string()));
        }
        pod.node_id = None;
        pod.status = PodStatus::Pending;
        self.pods.insert(pod.id, pod);
        Ok(())
    }

    pub fn pod(&self, id: &PodId) -> Result<&Pod, RegistryError> {
        self.pods.get(id).ok_or(RegistryError::PodNotFound(*id))
    }

    /// Pods in ascending id order.
    pub fn pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods.values()
    }

    pub fn pods_snapshot(&self) -> Vec<Pod> {
        self.pods.values().cloned().collect()
    }

    /// Unscheduled pods in ascending id order.
    pub fn pending_pods(&self) -> Vec<PodId> {
        self.pods
            .values()
            .filter(|p| p.is_pending())
            .map(|p| p.id)
            .collect()
    }

    /// Pods whose `node_id` points at `node_id`, found by scanning pods.
    ///
    /// Works even when the node record is already gone.
    pub fn pods_bound_to(&self, node_id: &NodeId) -> Vec<PodId> {
        self.pods
            .values()
            .filter(|p| p.node_id.as_ref() == Some(node_id))
            .map(|p| p.id)
            .collect()
    }

    /// Bind a pod to a node and commit its CPU request.
    ///
    /// Re-checks capacity even though the scheduler already did. Binding a
    /// pod to the node it is already on is a no-op.
    pub fn assign_pod(&mut self, pod_id: &PodId, node_id: &NodeId) -> Result<(), RegistryError> {
        let pod = self
            .pods
            .get(pod_id)
            .ok_or(RegistryError::PodNotFound(*pod_id))?;
        match pod.node_id {
            Some(current) if current == *node_id => return Ok(()),
            Some(current) => {
                return Err(RegistryError::PodAlreadyAssigned {
                    pod: *pod_id,
                    node: current,
                })
            }
            None => {}
        }
        let requested = pod.cpu_request;

        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or(RegistryError::NodeNotFound(*node_id))?;
        let idle = node.idle_capacity();
        if requested > idle {
            return Err(RegistryError::InsufficientCapacity {
                node: *node_id,
                pod: *pod_id,
                requested,
                idle,
            });
        }
        node.used_capacity += requested;
        node.pod_ids.push(*pod_id);

        if let Some(pod) = self.pods.get_mut(pod_id) {
            pod.node_id = Some(*node_id);
            pod.status = PodStatus::Running;
        }

        debug!(pod_id = %pod_id, node_id = %node_id, cpus = requested, "Pod assigned");
        Ok(())
    }

    /// Return a pod to `Pending` and release its CPU request.
    ///
    /// Returns the node it was bound to, or `None` if it was already
    /// unassigned. A missing node record is tolerated: the pod is still
    /// cleared.
    pub fn unassign_pod(&mut self, pod_id: &PodId) -> Result<Option<NodeId>, RegistryError> {
        let pod = self
            .pods
            .get(pod_id)
            .ok_or(RegistryError::PodNotFound(*pod_id))?;
        let Some(node_id) = pod.node_id else {
            return Ok(None);
        };
        let requested = pod.cpu_request;

        if let Some(node) = self.nodes.get(&node_id) {
            if !node.pod_ids.contains(pod_id) || node.used_capacity < requested {
                return Err(RegistryError::AccountingDiverged {
                    node: node_id,
                    recorded: node.used_capacity,
                    computed: self.assigned_cpus(&node_id),
                });
            }
        }

        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.used_capacity -= requested;
            node.pod_ids.retain(|id| id != pod_id);
        }
        if let Some(pod) = self.pods.get_mut(pod_id) {
            pod.node_id = None;
            pod.status = PodStatus::Pending;
        }

        debug!(pod_id = %pod_id, node_id = %node_id, "Pod unassigned");
        Ok(Some(node_id))
    }

    // =========================================================================
    // Invariants
    // =========================================================================

    /// Sum of CPU requests of pods bound to a node.
    fn assigned_cpus(&self, node_id: &NodeId) -> u64 {
        self.pods
            .values()
            .filter(|p| p.node_id.as_ref() == Some(node_id))
            .map(|p| u64::from(p.cpu_request))
            .sum()
    }

    /// Check that accounting fields and assignment lists agree.
    ///
    /// Any error here means the state is corrupt.
    pub fn verify_accounting(&self) -> Result<(), RegistryError> {
        for node in self.nodes.values() {
            let computed = self.assigned_cpus(&node.id);
            if computed != u64::from(node.used_capacity) {
                return Err(RegistryError::AccountingDiverged {
                    node: node.id,
                    recorded: node.used_capacity,
                    computed,
                });
            }
            if node.used_capacity > node.total_capacity {
                return Err(RegistryError::CapacityExceeded {
                    node: node.id,
                    used: node.used_capacity,
                    total: node.total_capacity,
                });
            }
            for pod_id in &node.pod_ids {
                let bound_here = self
                    .pods
                    .get(pod_id)
                    .is_some_and(|p| p.node_id == Some(node.id));
                if !bound_here {
                    return Err(RegistryError::AssignmentMismatch {
                        pod: *pod_id,
                        node: node.id,
                    });
                }
            }
        }

        for pod in self.pods.values() {
            if let Some(node_id) = pod.node_id {
                let listed = self
                    .nodes
                    .get(&node_id)
                    .is_some_and(|n| n.pod_ids.contains(&pod.id));
                if !listed {
                    return Err(RegistryError::AssignmentMismatch {
                        pod: pod.id,
                        node: node_id,
                    });
                }
            }
        }

        Ok(())
    }
}
