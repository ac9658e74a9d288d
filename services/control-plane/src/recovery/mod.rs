//! Node recovery.
//!
//! A recovery attempt walks `Triggered → Restarting → Verifying` and ends in
//! `Recovered` or `Evicted`:
//!
//! 1. Stop the node's unit (failure tolerated), wait for it to settle, start it.
//! 2. Poll `inspect` with backoff until the unit runs or the deadline passes.
//! 3. On success mark the node `Running`. Otherwise force-remove the unit,
//!    drop the node and re-place its pods on the remaining nodes.
//!
//! Before committing either result the node is looked up again under the
//! lock. A node removed meanwhile ends the attempt as `NodeGone`; a node an
//! operator stopped meanwhile is stopped again and left alone.
//!
//! Runtime calls and waits happen outside the registry lock. The eviction
//! itself (remove node, unassign pods, re-place them) commits as a single
//! critical section, so no observer sees pods bound to a node that no
//! longer exists.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fleetsim_id::{NodeId, PodId};
use fleetsim_reconcile::{poll_until, BackoffPolicy, ReconcileError};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::registry::{NodeStatus, Registry, RegistryError};
use crate::runtime::{ContainerRuntime, RuntimeError, UnitHandle};
use crate::scheduler::{place_pods, PlacementReport, Strategy};

/// Recovery configuration.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Pause between stopping and starting a unit.
    pub restart_settle: Duration,

    /// Deadline for a restarted unit to report running.
    pub verify_timeout: Duration,

    /// Delay schedule between verification probes.
    pub backoff: BackoffPolicy,

    /// Strategy used to re-place evicted pods.
    pub strategy: Strategy,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            restart_settle: Duration::from_secs(2),
            verify_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            strategy: Strategy::FirstFit,
        }
    }
}

/// Why a restart attempt gave up on a node.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("restart of node {node} failed: {source}")]
    RestartFailed {
        node: NodeId,
        #[source]
        source: RuntimeError,
    },

    #[error("node {node} did not come back: {source}")]
    VerificationFailed {
        node: NodeId,
        #[source]
        source: ReconcileError,
    },
}

/// Why a node was evicted.
#[derive(Debug)]
pub enum EvictionCause {
    Recovery(RecoveryError),
    Decommissioned,
}

impl fmt::Display for EvictionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recovery(e) => write!(f, "{e}"),
            Self::Decommissioned => f.write_str("decommissioned"),
        }
    }
}

/// Result of evicting a node and re-placing its pods.
#[derive(Debug)]
pub struct EvictionReport {
    pub node_id: NodeId,
    pub cause: EvictionCause,
    pub rescheduled: Vec<(PodId, NodeId)>,
    /// Pods left `Pending` for lack of capacity.
    pub unplaced: Vec<PodId>,
}

impl EvictionReport {
    /// Every displaced pod found a new node.
    pub fn is_clean(&self) -> bool {
        self.unplaced.is_empty()
    }
}

#[derive(Debug)]
pub enum RecoveryOutcome {
    /// The unit runs again; pods stayed where they were.
    Recovered,
    Evicted(EvictionReport),
    /// The node was removed by someone else while the attempt ran.
    NodeGone,
    /// An operator stopped the node while the attempt ran. It stays stopped.
    OperatorStopped,
    /// Another attempt for the same node is still running.
    AlreadyInProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    Triggered,
    Restarting,
    Verifying,
    Recovered,
    Evicted,
}

impl fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Triggered => "triggered",
            Self::Restarting => "restarting",
            Self::Verifying => "verifying",
            Self::Recovered => "recovered",
            Self::Evicted => "evicted",
        };
        f.write_str(s)
    }
}

/// Exclusive claim on a node, held by a recovery or an operator stop.
///
/// Released on drop.
pub(crate) struct InFlight<'a> {
    set: &'a Mutex<BTreeSet<NodeId>>,
    node_id: NodeId,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a Mutex<BTreeSet<NodeId>>, node_id: NodeId) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id);
        inserted.then_some(Self { set, node_id })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.node_id);
    }
}

/// What the registry says about a node once a restart attempt is over.
enum Recheck {
    Gone,
    OperatorStopped,
    Present,
}

/// Restarts failed nodes and evicts the ones that stay down.
pub struct RecoveryOrchestrator {
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    config: RecoveryConfig,
    in_flight: Mutex<BTreeSet<NodeId>>,
}

impl RecoveryOrchestrator {
    pub fn new(
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            registry,
            runtime,
            config,
            in_flight: Mutex::new(BTreeSet::new()),
        }
    }

    fn enter(&self, node_id: &NodeId, phase: RecoveryPhase) {
        info!(node_id = %node_id, phase = %phase, "Recovery phase");
    }

    /// Claim a node so no recovery starts on it until the guard drops.
    ///
    /// `None` if a recovery (or another claim) already holds it.
    pub(crate) fn claim(&self, node_id: &NodeId) -> Option<InFlight<'_>> {
        InFlight::acquire(&self.in_flight, *node_id)
    }

    /// Whether a recovery for `node_id` is running.
    pub fn is_in_flight(&self, node_id: &NodeId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(node_id)
    }

    /// Restart a node, evicting it if it does not come back.
    ///
    /// Errors only for an unknown node or a registry invariant violation.
    #[instrument(skip_all, fields(node_id = %node_id))]
    pub async fn restart_node(&self, node_id: &NodeId) -> Result<RecoveryOutcome, RegistryError> {
        self.enter(node_id, RecoveryPhase::Triggered);

        let Some(_guard) = self.claim(node_id) else {
            info!(node_id = %node_id, "Recovery already in progress");
            return Ok(RecoveryOutcome::AlreadyInProgress);
        };

        let unit = self.registry.node(node_id).await?.unit;

        self.enter(node_id, RecoveryPhase::Restarting);
        if let Err(e) = self.runtime.stop(&unit).await {
            warn!(node_id = %node_id, unit = %unit, error = %e, "Stop before restart failed, continuing");
        }
        if !self.config.restart_settle.is_zero() {
            tokio::time::sleep(self.config.restart_settle).await;
        }
        let started = self.runtime.start(&unit).await;

        self.enter(node_id, RecoveryPhase::Verifying);
        let verified = match started {
            Ok(()) => self
                .wait_running(&unit)
                .await
                .map_err(|source| RecoveryError::VerificationFailed {
                    node: *node_id,
                    source,
                }),
            Err(source) => {
                warn!(node_id = %node_id, error = %source, "Start failed");
                match self.runtime.inspect(&unit).await {
                    Ok(state) if state.running => Ok(()),
                    _ => Err(RecoveryError::RestartFailed {
                        node: *node_id,
                        source,
                    }),
                }
            }
        };

        let succeeded = verified.is_ok();
        let recheck = self
            .registry
            .transact(|state| {
                let operator_stopped = match state.node(node_id) {
                    Ok(node) => node.operator_stopped,
                    Err(_) => return Recheck::Gone,
                };
                if operator_stopped {
                    return Recheck::OperatorStopped;
                }
                if succeeded {
                    // Present, so this cannot fail
                    let _ = state.set_node_status(node_id, NodeStatus::Running);
                }
                Recheck::Present
            })
            .await;

        match (recheck, verified) {
            (Recheck::Gone, _) => {
                info!(node_id = %node_id, "Node removed during recovery");
                Ok(RecoveryOutcome::NodeGone)
            }
            (Recheck::OperatorStopped, _) => {
                info!(node_id = %node_id, "Node stopped by operator during recovery, leaving it stopped");
                if let Err(e) = self.runtime.stop(&unit).await {
                    warn!(node_id = %node_id, unit = %unit, error = %e, "Failed to stop unit again");
                }
                Ok(RecoveryOutcome::OperatorStopped)
            }
            (Recheck::Present, Ok(())) => {
                self.enter(node_id, RecoveryPhase::Recovered);
                Ok(RecoveryOutcome::Recovered)
            }
            (Recheck::Present, Err(cause)) => {
                warn!(node_id = %node_id, error = %cause, "Restart did not recover node");
                if let Err(e) = self.runtime.remove(&unit, true).await {
                    warn!(node_id = %node_id, unit = %unit, error = %e, "Failed to remove unit");
                }
                let report = self
                    .evict_and_reschedule(node_id, EvictionCause::Recovery(cause))
                    .await?;
                Ok(RecoveryOutcome::Evicted(report))
            }
        }
    }

    /// Poll the unit until it reports running.
    async fn wait_running(&self, unit: &UnitHandle) -> Result<(), ReconcileError> {
        let runtime = &self.runtime;
        poll_until(
            unit.as_str(),
            &self.config.backoff,
            self.config.verify_timeout,
            || async move {
                match runtime.inspect(unit).await {
                    Ok(state) if state.running => Some(()),
                    _ => None,
                }
            },
        )
        .await
    }

    /// Drop a node from the registry and re-place its pods elsewhere.
    ///
    /// Runs as one critical section. Works whether or not the node record
    /// still exists.
    pub async fn evict_and_reschedule(
        &self,
        node_id: &NodeId,
        cause: EvictionCause,
    ) -> Result<EvictionReport, RegistryError> {
        self.enter(node_id, RecoveryPhase::Evicted);
        let strategy = self.config.strategy;

        let placement = self
            .registry
            .transact(|state| -> Result<PlacementReport, RegistryError> {
                let displaced = match state.node(node_id) {
                    Ok(node) => node.pod_ids.clone(),
                    Err(_) => state.pods_bound_to(node_id),
                };
                if state.contains_node(node_id) {
                    state.remove_node(node_id)?;
                }
                for pod_id in &displaced {
                    state.unassign_pod(pod_id)?;
                }
                Ok(place_pods(state, &displaced, strategy))
            })
            .await?;

        let report = EvictionReport {
            node_id: *node_id,
            cause,
            rescheduled: placement.placed,
            unplaced: placement.unplaced,
        };

        if report.is_clean() {
            info!(
                node_id = %node_id,
                cause = %report.cause,
                rescheduled = report.rescheduled.len(),
                "Node evicted"
            );
        } else {
            warn!(
                node_id = %node_id,
                cause = %report.cause,
                rescheduled = report.rescheduled.len(),
                unplaced = report.unplaced.len(),
                "Node evicted, some pods left pending"
            );
        }
        Ok(report)
    }
}
