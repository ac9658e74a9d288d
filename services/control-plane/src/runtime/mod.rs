//! Container runtime interface.
//!
//! The control plane never touches a node's execution unit directly. Every
//! create/start/stop/remove/inspect goes through [`ContainerRuntime`], and
//! every call may block for seconds, so callers must not hold the registry
//! lock across one.
//!
//! Two implementations are provided:
//! - [`MockRuntime`]: in-memory and scriptable, for tests and local runs.
//! - [`DockerRuntime`]: Docker Engine API over its unix socket.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod docker;
mod mock;

pub use docker::{DockerConfig, DockerRuntime};
pub use mock::{MockRuntime, RuntimeCall, StartBehavior};

/// Handle to a node's backing execution unit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitHandle(String);

impl UnitHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UnitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Observed state of a unit. `exit_code` is only meaningful when not running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitState {
    pub running: bool,
    pub exit_code: i64,
}

impl UnitState {
    pub fn running() -> Self {
        Self {
            running: true,
            exit_code: 0,
        }
    }

    pub fn exited(exit_code: i64) -> Self {
        Self {
            running: false,
            exit_code,
        }
    }
}

/// Errors from container runtime calls.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime could not be reached or the call failed in transport.
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("unit not found: {0}")]
    NotFound(String),

    /// The runtime answered with an error.
    #[error("runtime API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("runtime call timed out after {0:?}")]
    Timeout(Duration),
}

/// Lifecycle operations on a node's backing execution unit.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a unit sized for `cpu_hint` CPUs.
    async fn create(&self, cpu_hint: u32) -> Result<UnitHandle, RuntimeError>;

    async fn start(&self, unit: &UnitHandle) -> Result<(), RuntimeError>;

    /// Stop a unit. Stopping an already stopped unit succeeds.
    async fn stop(&self, unit: &UnitHandle) -> Result<(), RuntimeError>;

    async fn remove(&self, unit: &UnitHandle, force: bool) -> Result<(), RuntimeError>;

    async fn inspect(&self, unit: &UnitHandle) -> Result<UnitState, RuntimeError>;
}
