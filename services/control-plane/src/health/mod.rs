//! Node health monitoring.
//!
//! A single long-lived loop polls every node's unit through the container
//! runtime, commits status transitions with compare-and-set, and hands
//! crashed nodes to the recovery orchestrator as separate tasks.

mod monitor;
mod transition;

pub use monitor::{HealthMonitor, HealthMonitorConfig, PassReport, StatusChange};
pub use transition::{evaluate, HealthAction, Observation, Transition};
