//! Pod placement.
//!
//! The scheduler is split in three layers:
//! - [`schedule_pod`]: a pure decision over a node snapshot
//! - [`place_pods`] / [`place_pending`]: a pass that decides and commits
//!   against live registry state, inside one critical section
//! - [`SchedulerWorker`]: a background loop that retries pending pods

mod pass;
mod placement;
mod worker;

pub use pass::{place_pending, place_pods, PlacementReport};
pub use placement::{schedule_pod, ParseStrategyError, ScheduleError, Strategy};
pub use worker::SchedulerWorker;
