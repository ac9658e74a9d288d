//! Placement decisions.

use std::fmt;
use std::str::FromStr;

use fleetsim_id::{NodeId, PodId};
use thiserror::Error;

use crate::registry::{Node, Pod};

/// Errors from a placement decision.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("no node has {cpu_request} idle CPUs for pod {pod}")]
    NoCapacity { pod: PodId, cpu_request: u32 },
}

/// Placement strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Lowest node id with enough idle capacity.
    #[default]
    FirstFit,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstFit => f.write_str("first_fit"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown placement strategy: {0}")]
pub struct ParseStrategyError(String);

impl FromStr for Strategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first_fit" => Ok(Self::FirstFit),
            other => Err(ParseStrategyError(other.to_string())),
        }
    }
}

/// Pick a node for `pod`. Does not mutate anything.
///
/// Only `Running` nodes are candidates. Candidates are considered in
/// ascending id order regardless of the order they are passed in.
pub fn schedule_pod<'a>(
    pod: &Pod,
    nodes: impl IntoIterator<Item = &'a Node>,
    strategy: Strategy,
) -> Result<NodeId, ScheduleError> {
    let mut candidates: Vec<&Node> = nodes.into_iter().filter(|n| n.is_schedulable()).collect();
    candidates.sort_by_key(|n| n.id);

    let chosen = match strategy {
        Strategy::FirstFit => candidates
            .into_iter()
            .find(|n| n.idle_capacity() >= pod.cpu_request),
    };

    chosen.map(|n| n.id).ok_or(ScheduleError::NoCapacity {
        pod: pod.id,
        cpu_request: pod.cpu_request,
    })
}
