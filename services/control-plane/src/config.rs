use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::health::HealthMonitorConfig;
use crate::recovery::RecoveryConfig;
use crate::runtime::DockerConfig;
use crate::scheduler::Strategy;

/// Which container runtime backs the nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Mock,
    Docker,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub runtime: RuntimeKind,
    pub docker: DockerConfig,
    /// CPU sizes of the nodes provisioned at startup.
    pub bootstrap_nodes: Vec<u32>,
    /// CPU requests of the pods submitted at startup.
    pub bootstrap_pods: Vec<u32>,
    pub health: HealthMonitorConfig,
    pub recovery: RecoveryConfig,
    pub schedule_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_level = lookup("FLEETSIM_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let runtime = match lookup("FLEETSIM_RUNTIME").as_deref().unwrap_or("mock") {
            "mock" => RuntimeKind::Mock,
            "docker" => RuntimeKind::Docker,
            other => bail!("FLEETSIM_RUNTIME must be 'mock' or 'docker', got '{other}'"),
        };

        let mut docker = DockerConfig::default();
        if let Some(socket) = lookup("FLEETSIM_DOCKER_SOCKET") {
            docker.socket_path = socket;
        }
        if let Some(image) = lookup("FLEETSIM_NODE_IMAGE") {
            docker.image = image;
        }

        let bootstrap_nodes = parse_list(
            "FLEETSIM_BOOTSTRAP_NODES",
            lookup("FLEETSIM_BOOTSTRAP_NODES").as_deref().unwrap_or("4,2"),
        )?;
        let bootstrap_pods = parse_list(
            "FLEETSIM_BOOTSTRAP_PODS",
            lookup("FLEETSIM_BOOTSTRAP_PODS").as_deref().unwrap_or(""),
        )?;

        let health = HealthMonitorConfig {
            interval: Duration::from_secs(parse_or(&lookup, "FLEETSIM_HEALTH_INTERVAL_SECS", 10)?),
            inspect_timeout: Duration::from_secs(parse_or(&lookup, "FLEETSIM_INSPECT_TIMEOUT_SECS", 5)?),
            unreachable_threshold: match lookup("FLEETSIM_UNREACHABLE_THRESHOLD") {
                Some(v) => Some(
                    v.parse()
                        .with_context(|| format!("invalid FLEETSIM_UNREACHABLE_THRESHOLD: {v}"))?,
                ),
                None => None,
            },
        };
        if health.interval.is_zero() {
            bail!("FLEETSIM_HEALTH_INTERVAL_SECS must be positive");
        }

        let strategy: Strategy = lookup("FLEETSIM_STRATEGY")
            .as_deref()
            .unwrap_or("first_fit")
            .parse()?;

        let recovery = RecoveryConfig {
            restart_settle: Duration::from_millis(parse_or(&lookup, "FLEETSIM_RESTART_SETTLE_MS", 2000)?),
            verify_timeout: Duration::from_secs(parse_or(&lookup, "FLEETSIM_VERIFY_TIMEOUT_SECS", 10)?),
            strategy,
            ..RecoveryConfig::default()
        };

        let schedule_interval =
            Duration::from_secs(parse_or(&lookup, "FLEETSIM_SCHEDULE_INTERVAL_SECS", 5)?);
        if schedule_interval.is_zero() {
            bail!("FLEETSIM_SCHEDULE_INTERVAL_SECS must be positive");
        }

        Ok(Self {
            log_level,
            runtime,
            docker,
            bootstrap_nodes,
            bootstrap_pods,
            health,
            recovery,
            schedule_interval,
        })
    }
}

fn parse_or<F>(lookup: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(v) => v
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {v}")),
        None => Ok(default),
    }
}

/// Parse a comma-separated list of CPU counts. Blank entries are skipped.
fn parse_list(key: &str, raw: &str) -> Result<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().with_context(|| format!("invalid {key} entry: {s}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.runtime, RuntimeKind::Mock);
        assert_eq!(config.docker.socket_path, "/var/run/docker.sock");
        assert_eq!(config.bootstrap_nodes, vec![4, 2]);
        assert!(config.bootstrap_pods.is_empty());
        assert_eq!(config.health.interval, Duration::from_secs(10));
        assert_eq!(config.health.unreachable_threshold, None);
        assert_eq!(config.recovery.restart_settle, Duration::from_millis(2000));
        assert_eq!(config.recovery.verify_timeout, Duration::from_secs(10));
        assert_eq!(config.recovery.strategy, Strategy::FirstFit);
        assert_eq!(config.schedule_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("FLEETSIM_RUNTIME", "docker"),
            ("FLEETSIM_NODE_IMAGE", "alpine:3"),
            ("FLEETSIM_BOOTSTRAP_NODES", "8, 4 ,2"),
            ("FLEETSIM_BOOTSTRAP_PODS", "3,1"),
            ("FLEETSIM_UNREACHABLE_THRESHOLD", "3"),
            ("FLEETSIM_RESTART_SETTLE_MS", "0"),
        ])
        .unwrap();
        assert_eq!(config.runtime, RuntimeKind::Docker);
        assert_eq!(config.docker.image, "alpine:3");
        assert_eq!(config.bootstrap_nodes, vec![8, 4, 2]);
        assert_eq!(config.bootstrap_pods, vec![3, 1]);
        assert_eq!(config.health.unreachable_threshold, Some(3));
        assert!(config.recovery.restart_settle.is_zero());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(config(&[("FLEETSIM_RUNTIME", "podman")]).is_err());
        assert!(config(&[("FLEETSIM_BOOTSTRAP_NODES", "4,x")]).is_err());
        assert!(config(&[("FLEETSIM_STRATEGY", "best_fit")]).is_err());
        assert!(config(&[("FLEETSIM_HEALTH_INTERVAL_SECS", "0")]).is_err());
        assert!(config(&[("FLEETSIM_UNREACHABLE_THRESHOLD", "-1")]).is_err());
    }
}
