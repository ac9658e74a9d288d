//! Control loop primitives.
//!
//! Helpers shared by the control plane's background loops:
//!
//! - **Backoff**: exponential delays with jitter between retries.
//! - **Bounded polling**: probe a condition with backoff until it holds or a
//!   deadline passes, instead of sleeping a fixed amount and hoping.
//! - **Failure streaks**: count consecutive failures per resource so a loop
//!   can escalate only after a configurable number of misses.
//!
//! # Invariants
//!
//! - A bounded poll probes at least once, and once more at the deadline.
//! - A failure streak only grows through `record_failure` and is cleared by
//!   any success.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Timeout waiting for convergence.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
        attempts: u32,
    },
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            max: Duration::from_secs(2),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// A policy without jitter, for callers that need exact delays.
    pub fn fixed(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2.0_f64.powi(attempt.min(30) as i32);
        let delay = (self.base.as_millis() as f64 * exp).min(self.max.as_millis() as f64);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Duration::from_millis(delay as u64);
        }

        let spread = delay * jitter;
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_millis((delay + offset).max(0.0) as u64)
    }
}

// =============================================================================
// Bounded Polling
// =============================================================================

/// Probe until it yields a value or `timeout` elapses.
///
/// `probe` is called immediately, then after each backoff delay. The last
/// sleep is shortened so the final probe lands on the deadline.
pub async fn poll_until<T, F, Fut>(
    resource: &str,
    policy: &BackoffPolicy,
    timeout: Duration,
    mut probe: F,
) -> Result<T, ReconcileError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let started = Instant::now();
    let deadline = started + timeout;
    let mut attempts = 0u32;

    loop {
        if let Some(value) = probe().await {
            return Ok(value);
        }
        attempts += 1;

        let now = Instant::now();
        if now >= deadline {
            return Err(ReconcileError::Timeout {
                resource: resource.to_string(),
                elapsed: now.duration_since(started),
                attempts,
            });
        }

        let wait = policy.delay(attempts - 1).min(deadline - now);
        tokio::time::sleep(wait).await;
    }
}

// =============================================================================
// Failure Streaks
// =============================================================================

/// Consecutive-failure counter keyed by resource.
#[derive(Debug, Clone)]
pub struct FailureStreaks<K: Ord + Clone> {
    streaks: BTreeMap<K, u32>,
}

impl<K: Ord + Clone> Default for FailureStreaks<K> {
    fn default() -> Self {
        Self {
            streaks: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone> FailureStreaks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the current streak length.
    pub fn record_failure(&mut self, key: &K) -> u32 {
        let count = self.streaks.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Clear the streak for a resource (on success).
    pub fn clear(&mut self, key: &K) {
        self.streaks.remove(key);
    }

    /// Current streak length (0 if none).
    pub fn streak(&self, key: &K) -> u32 {
        self.streaks.get(key).copied().unwrap_or(0)
    }

    /// Drop streaks for resources that no longer exist.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&K) -> bool,
    {
        self.streaks.retain(|k, _| keep(k));
    }

    pub fn is_empty(&self) -> bool {
        self.streaks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_until_max() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(500));
        assert_eq!(policy.delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: 0.5,
        };
        for _ in 0..100 {
            let d = policy.delay(0).as_millis();
            assert!((50..=150).contains(&d), "delay {d} out of range");
        }
    }

    #[tokio::test]
    async fn test_poll_until_returns_first_success() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::fixed(Duration::from_millis(1), Duration::from_millis(5));

        let result = poll_until("unit", &policy, Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { (n >= 2).then_some(n) }
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(5), Duration::from_millis(10));

        let err = poll_until("unit-a", &policy, Duration::from_millis(40), || async {
            None::<()>
        })
        .await
        .unwrap_err();

        let ReconcileError::Timeout {
            resource,
            elapsed,
            attempts,
        } = err;
        assert_eq!(resource, "unit-a");
        assert!(elapsed >= Duration::from_millis(40));
        assert!(attempts >= 2);
    }

    #[tokio::test]
    async fn test_poll_until_zero_timeout_probes_once() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::default();

        let result = poll_until("unit", &policy, Duration::ZERO, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { None::<()> }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_streaks() {
        let mut streaks = FailureStreaks::new();

        assert_eq!(streaks.record_failure(&"node-1"), 1);
        assert_eq!(streaks.record_failure(&"node-1"), 2);
        assert_eq!(streaks.record_failure(&"node-2"), 1);
        assert_eq!(streaks.streak(&"node-1"), 2);

        streaks.clear(&"node-1");
        assert_eq!(streaks.streak(&"node-1"), 0);

        streaks.retain(|k| *k != "node-2");
        assert!(streaks.is_empty());
    }
}
