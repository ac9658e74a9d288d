//! Placement passes over live registry state.
//!
//! A pass is always run inside one registry critical section (see
//! [`crate::registry::Registry::transact`]), so each decision sees the
//! commits of the decisions before it.

use fleetsim_id::{NodeId, PodId};
use tracing::{debug, info, warn};

use super::placement::{schedule_pod, Strategy};
use crate::registry::RegistryState;

/// Outcome of a placement pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementReport {
    /// Pods bound by this pass, with their node.
    pub placed: Vec<(PodId, NodeId)>,
    /// Pods left `Pending`.
    pub unplaced: Vec<PodId>,
}

impl PlacementReport {
    pub fn is_empty(&self) -> bool {
        self.placed.is_empty() && self.unplaced.is_empty()
    }
}

/// Schedule and commit each pod in `pod_ids`, in the given order.
///
/// Pods that are unknown or already bound are skipped.
pub fn place_pods(state: &mut RegistryState, pod_ids: &[PodId], strategy: Strategy) -> PlacementReport {
    let mut report = PlacementReport::default();

    for pod_id in pod_ids {
        let pod = match state.pod(pod_id) {
            Ok(pod) if pod.is_pending() => pod.clone(),
            Ok(_) => {
                debug!(pod_id = %pod_id, "Pod already bound, skipping");
                continue;
            }
            Err(e) => {
                warn!(pod_id = %pod_id, error = %e, "Pod vanished before placement");
                continue;
            }
        };

        let node_id = match schedule_pod(&pod, state.nodes(), strategy) {
            Ok(node_id) => node_id,
            Err(e) => {
                warn!(pod_id = %pod_id, error = %e, "Pod left pending");
                report.unplaced.push(*pod_id);
                continue;
            }
        };

        match state.assign_pod(pod_id, &node_id) {
            Ok(()) => {
                info!(pod_id = %pod_id, node_id = %node_id, cpus = pod.cpu_request, "Pod placed");
                report.placed.push((*pod_id, node_id));
            }
            Err(e) => {
                warn!(pod_id = %pod_id, node_id = %node_id, error = %e, "Placement commit rejected");
                report.unplaced.push(*pod_id);
            }
        }
    }

    report
}

/// Place every pending pod, ascending by id.
pub fn place_pending(state: &mut RegistryState, strategy: Strategy) -> PlacementReport {
    let pending = state.pending_pods();
    place_pods(state, &pending, strategy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Node, Pod};
    use crate::runtime::UnitHandle;

    fn nid(n: u64) -> NodeId {
        NodeId::from_parts(n, 0)
    }

    fn pid(n: u64) -> PodId {
        PodId::from_parts(n, 0)
    }

    fn cluster(nodes: &[(u64, u32)], pods: &[(u64, u32)]) -> RegistryState {
        let mut state = RegistryState::new();
        for (n, cpus) in nodes {
            state
                .add_node(Node::new(nid(*n), UnitHandle::new(format!("u{n}")), *cpus))
                .unwrap();
        }
        for (p, cpus) in pods {
            state.add_pod(Pod::new(pid(*p), *cpus)).unwrap();
        }
        state
    }

    #[test]
    fn test_pass_sees_its_own_commits() {
        let mut state = cluster(&[(1, 4), (2, 2)], &[(1, 3), (2, 2), (3, 1)]);

        let report = place_pending(&mut state, Strategy::FirstFit);

        assert_eq!(
            report.placed,
            vec![(pid(1), nid(1)), (pid(2), nid(2)), (pid(3), nid(1))]
        );
        assert!(report.unplaced.is_empty());
        assert_eq!(state.node(&nid(1)).unwrap().used_capacity, 4);
        assert_eq!(state.node(&nid(2)).unwrap().used_capacity, 2);
        state.verify_accounting().unwrap();
    }

    #[test]
    fn test_unplaceable_pods_stay_pending() {
        let mut state = cluster(&[(1, 2)], &[(1, 2), (2, 1)]);

        let report = place_pending(&mut state, Strategy::FirstFit);

        assert_eq!(report.placed, vec![(pid(1), nid(1))]);
        assert_eq!(report.unplaced, vec![pid(2)]);
        assert_eq!(state.pending_pods(), vec![pid(2)]);
    }

    #[test]
    fn test_given_order_is_respected() {
        let mut state = cluster(&[(1, 3)], &[(1, 2), (2, 3)]);

        let report = place_pods(&mut state, &[pid(2), pid(1)], Strategy::FirstFit);

        assert_eq!(report.placed, vec![(pid(2), nid(1))]);
        assert_eq!(report.unplaced, vec![pid(1)]);
    }

    #[test]
    fn test_bound_and_unknown_pods_are_skipped() {
        let mut state = cluster(&[(1, 4)], &[(1, 1)]);
        state.assign_pod(&pid(1), &nid(1)).unwrap();

        let report = place_pods(&mut state, &[pid(1), pid(9)], Strategy::FirstFit);

        assert!(report.is_empty());
        assert_eq!(state.node(&nid(1)).unwrap().used_capacity, 1);
    }
}
