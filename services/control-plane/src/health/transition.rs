//! Node status transition table.

use crate::registry::NodeStatus;
use crate::runtime::UnitState;

/// What one poll learned about a node's unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Running,
    Exited { exit_code: i64 },
    /// The inspect call failed or timed out.
    Unreachable,
}

impl From<UnitState> for Observation {
    fn from(state: UnitState) -> Self {
        if state.running {
            Self::Running
        } else {
            Self::Exited {
                exit_code: state.exit_code,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    None,
    Recover,
}

/// Status to commit and whether to start a recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub status: NodeStatus,
    pub action: HealthAction,
}

impl Transition {
    fn to(status: NodeStatus) -> Self {
        Self {
            status,
            action: HealthAction::None,
        }
    }
}

/// Decide the next status from the previous one and an observation.
///
/// A clean exit is an intentional stop. A failed exit triggers recovery
/// unless the node was already stopped. Unreachable nodes are only marked
/// unhealthy here; escalation is the monitor's call.
pub fn evaluate(previous: NodeStatus, observation: Observation) -> Transition {
    match observation {
        Observation::Running => Transition::to(NodeStatus::Running),
        Observation::Exited { exit_code: 0 } => Transition::to(NodeStatus::Stopped),
        Observation::Exited { .. } if previous == NodeStatus::Stopped => {
            Transition::to(NodeStatus::Unhealthy)
        }
        Observation::Exited { .. } => Transition {
            status: NodeStatus::Unhealthy,
            action: HealthAction::Recover,
        },
        Observation::Unreachable => Transition::to(NodeStatus::Unhealthy),
    }
}
