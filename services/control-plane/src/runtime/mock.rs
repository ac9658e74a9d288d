//! In-memory container runtime.
//!
//! Units live in a map and behave like containers: created stopped, started
//! on demand, stopped with exit code 0 unless scripted otherwise. Tests
//! script failures per unit (crash with an exit code, make inspect fail, make
//! start fail or exit right away, make stop/remove fail) and read back the
//! call log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ContainerRuntime, RuntimeError, UnitHandle, UnitState};

/// What happens when a unit is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartBehavior {
    /// The unit starts and keeps running.
    #[default]
    Normal,
    /// The start call itself fails.
    Fail,
    /// The start call succeeds but the unit exits at once with this code.
    ExitImmediately(i64),
}

/// A recorded runtime call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Create { cpu_hint: u32 },
    Start(UnitHandle),
    Stop(UnitHandle),
    Remove { unit: UnitHandle, force: bool },
    Inspect(UnitHandle),
}

#[derive(Debug, Clone)]
struct MockUnit {
    state: UnitState,
    start_behavior: StartBehavior,
    inspect_fails: bool,
    stop_fails: bool,
    /// Exit code a `stop` leaves behind.
    stop_exit_code: i64,
    remove_fails: bool,
}

impl MockUnit {
    fn created() -> Self {
        Self {
            state: UnitState::exited(0),
            start_behavior: StartBehavior::Normal,
            inspect_fails: false,
            stop_fails: false,
            stop_exit_code: 0,
            remove_fails: false,
        }
    }
}

/// Mock runtime for testing and development.
pub struct MockRuntime {
    /// Counter for generating unit handles.
    counter: AtomicU64,

    /// When set, every call fails as if the daemon were down.
    unavailable: AtomicBool,

    /// Artificial delay applied to every call.
    latency: Duration,

    units: Mutex<HashMap<UnitHandle, MockUnit>>,

    calls: Mutex<Vec<RuntimeCall>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            latency: Duration::ZERO,
            units: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Simulate a runtime whose calls take `latency` each.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::new()
        }
    }

    fn next_handle(&self) -> UnitHandle {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        UnitHandle::new(format!("unit_{n:04}"))
    }

    async fn enter(&self, call: RuntimeCall) -> Result<(), RuntimeError> {
        self.calls.lock().await.push(call);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("mock runtime offline".to_string()));
        }
        Ok(())
    }

    async fn update<F>(&self, unit: &UnitHandle, f: F) -> bool
    where
        F: FnOnce(&mut MockUnit),
    {
        match self.units.lock().await.get_mut(unit) {
            Some(u) => {
                f(u);
                true
            }
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Scripting
    // -------------------------------------------------------------------------

    /// Take the whole runtime offline (or back online).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The unit's process dies with `exit_code`.
    pub async fn crash(&self, unit: &UnitHandle, exit_code: i64) -> bool {
        self.update(unit, |u| u.state = UnitState::exited(exit_code))
            .await
    }

    /// Make `stop` leave the unit exited with `exit_code`, like a process
    /// that ignores SIGTERM and gets killed.
    pub async fn set_stop_exit_code(&self, unit: &UnitHandle, exit_code: i64) -> bool {
        self.update(unit, |u| u.stop_exit_code = exit_code).await
    }

    pub async fn set_start_behavior(&self, unit: &UnitHandle, behavior: StartBehavior) -> bool {
        self.update(unit, |u| u.start_behavior = behavior).await
    }

    pub async fn set_inspect_failure(&self, unit: &UnitHandle, fails: bool) -> bool {
        self.update(unit, |u| u.inspect_fails = fails).await
    }

    pub async fn set_stop_failure(&self, unit: &UnitHandle, fails: bool) -> bool {
        self.update(unit, |u| u.stop_fails = fails).await
    }

    pub async fn set_remove_failure(&self, unit: &UnitHandle, fails: bool) -> bool {
        self.update(unit, |u| u.remove_fails = fails).await
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub async fn exists(&self, unit: &UnitHandle) -> bool {
        self.units.lock().await.contains_key(unit)
    }

    pub async fn is_running(&self, unit: &UnitHandle) -> bool {
        self.units
            .lock()
            .await
            .get(unit)
            .is_some_and(|u| u.state.running)
    }

    pub async fn unit_count(&self) -> usize {
        self.units.lock().await.len()
    }

    pub async fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().await.clone()
    }

    /// Number of `start` calls made against a unit.
    pub async fn start_count(&self, unit: &UnitHandle) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| matches!(c, RuntimeCall::Start(h) if h == unit))
            .count()
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, cpu_hint: u32) -> Result<UnitHandle, RuntimeError> {
        self.enter(RuntimeCall::Create { cpu_hint }).await?;

        let handle = self.next_handle();
        self.units
            .lock()
            .await
            .insert(handle.clone(), MockUnit::created());

        info!(unit = %handle, cpu_hint, "[MOCK] Created unit");
        Ok(handle)
    }

    async fn start(&self, unit: &UnitHandle) -> Result<(), RuntimeError> {
        self.enter(RuntimeCall::Start(unit.clone())).await?;

        let mut units = self.units.lock().await;
        let u = units
            .get_mut(unit)
            .ok_or_else(|| RuntimeError::NotFound(unit.to_string()))?;

        match u.start_behavior {
            StartBehavior::Normal => u.state = UnitState::running(),
            StartBehavior::Fail => {
                return Err(RuntimeError::Api {
                    status: 500,
                    message: format!("cannot start {unit}"),
                });
            }
            StartBehavior::ExitImmediately(code) => u.state = UnitState::exited(code),
        }

        debug!(unit = %unit, running = u.state.running, "[MOCK] Started unit");
        Ok(())
    }

    async fn stop(&self, unit: &UnitHandle) -> Result<(), RuntimeError> {
        self.enter(RuntimeCall::Stop(unit.clone())).await?;

        let mut units = self.units.lock().await;
        let u = units
            .get_mut(unit)
            .ok_or_else(|| RuntimeError::NotFound(unit.to_string()))?;

        if u.stop_fails {
            return Err(RuntimeError::Api {
                status: 500,
                message: format!("cannot stop {unit}"),
            });
        }
        if u.state.running {
            u.state = UnitState::exited(u.stop_exit_code);
            debug!(unit = %unit, exit_code = u.stop_exit_code, "[MOCK] Stopped unit");
        }
        Ok(())
    }

    async fn remove(&self, unit: &UnitHandle, force: bool) -> Result<(), RuntimeError> {
        self.enter(RuntimeCall::Remove {
            unit: unit.clone(),
            force,
        })
        .await?;

        let mut units = self.units.lock().await;
        let u = units
            .get(unit)
            .ok_or_else(|| RuntimeError::NotFound(unit.to_string()))?;

        if u.remove_fails {
            return Err(RuntimeError::Api {
                status: 500,
                message: format!("cannot remove {unit}"),
            });
        }
        if u.state.running && !force {
            return Err(RuntimeError::Api {
                status: 409,
                message: format!("{unit} is running"),
            });
        }

        units.remove(unit);
        debug!(unit = %unit, force, "[MOCK] Removed unit");
        Ok(())
    }

    async fn inspect(&self, unit: &UnitHandle) -> Result<UnitState, RuntimeError> {
        self.enter(RuntimeCall::Inspect(unit.clone())).await?;

        let units = self.units.lock().await;
        let u = units
            .get(unit)
            .ok_or_else(|| RuntimeError::NotFound(unit.to_string()))?;

        if u.inspect_fails {
            return Err(RuntimeError::Unavailable(format!("inspect {unit} failed")));
        }
        Ok(u.state)
    }
}
