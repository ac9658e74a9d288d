//! Docker Engine runtime.
//!
//! Talks to the Docker Engine HTTP API over its unix socket. Each node is
//! backed by one container named `node_container_<uuid>` running an idle
//! loop; the container name doubles as the unit handle.
//!
//! The loop runs as PID 1, which gets no default SIGTERM handler, so it
//! traps TERM and exits 0. A `docker stop` then reads as a clean exit instead
//! of a SIGKILL with code 137.
//!
//! Reference: https://docs.docker.com/engine/api/v1.43/

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{ContainerRuntime, RuntimeError, UnitHandle, UnitState};

/// Docker runtime configuration.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Path to the Docker Engine socket.
    pub socket_path: String,

    /// Image used for node containers.
    pub image: String,

    /// Upper bound for a single API call.
    pub request_timeout: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: "/var/run/docker.sock".to_string(),
            image: "python:3.8-slim".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Idle loop run by every node container. `wait` returns as soon as a
/// signal arrives, so the trap fires without waiting out the sleep.
const NODE_COMMAND: &str = "trap 'exit 0' TERM INT; while :; do sleep 30 & wait $!; done";

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainer<'a> {
    image: &'a str,
    cmd: [&'a str; 3],
    labels: HashMap<&'a str, &'a str>,
    host_config: HostConfig,
}

impl<'a> CreateContainer<'a> {
    fn node(image: &'a str, cpu_hint: u32) -> Self {
        Self {
            image,
            cmd: ["sh", "-c", NODE_COMMAND],
            labels: HashMap::from([("fleetsim.role", "node")]),
            host_config: HostConfig {
                nano_cpus: i64::from(cpu_hint) * 1_000_000_000,
            },
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    nano_cpus: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    state: ContainerState,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    running: bool,
    exit_code: i64,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Container runtime backed by a local Docker Engine.
pub struct DockerRuntime {
    config: DockerConfig,
    client: Client<UnixConnector>,
}

impl DockerRuntime {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config,
            client: Client::unix(),
        }
    }

    /// Send a request and return the status and raw body.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Vec<u8>), RuntimeError> {
        let uri: hyper::Uri = Uri::new(&self.config.socket_path, path).into();

        debug!(method = %method, path = path, "Docker API request");

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        let body = match body {
            Some(bytes) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(bytes)
            }
            None => Body::empty(),
        };
        let request = builder
            .body(body)
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        let timeout = self.config.request_timeout;
        let response = tokio::time::timeout(timeout, self.client.request(request))
            .await
            .map_err(|_| RuntimeError::Timeout(timeout))?
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        Ok((status, bytes.to_vec()))
    }

    /// Map a failed response. A 404 only means the unit is gone when the
    /// request addressed a container; pass `None` otherwise.
    fn api_error(status: StatusCode, body: &[u8], unit: Option<&str>) -> RuntimeError {
        if let (StatusCode::NOT_FOUND, Some(unit)) = (status, unit) {
            return RuntimeError::NotFound(unit.to_string());
        }
        let message = serde_json::from_slice::<ErrorBody>(body)
            .map(|e| e.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(body).to_string());
        RuntimeError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, cpu_hint: u32) -> Result<UnitHandle, RuntimeError> {
        let name = format!("node_container_{}", uuid::Uuid::new_v4());
        let spec = CreateContainer::node(&self.config.image, cpu_hint);
        let body = serde_json::to_vec(&spec)
            .map_err(|e| RuntimeError::Unavailable(format!("encode create request: {e}")))?;

        let path = format!("/containers/create?name={name}");
        let (status, body) = self.send(Method::POST, &path, Some(body)).await?;
        if !status.is_success() {
            // 404 here is a missing image, not a missing unit
            return Err(Self::api_error(status, &body, None));
        }

        info!(container = %name, cpu_hint, image = %self.config.image, "Created node container");
        Ok(UnitHandle::new(name))
    }

    async fn start(&self, unit: &UnitHandle) -> Result<(), RuntimeError> {
        let path = format!("/containers/{unit}/start");
        let (status, body) = self.send(Method::POST, &path, None).await?;
        match status {
            s if s.is_success() => Ok(()),
            // Already started
            StatusCode::NOT_MODIFIED => Ok(()),
            s => Err(Self::api_error(s, &body, Some(unit.as_str()))),
        }
    }

    async fn stop(&self, unit: &UnitHandle) -> Result<(), RuntimeError> {
        let path = format!("/containers/{unit}/stop");
        let (status, body) = self.send(Method::POST, &path, None).await?;
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_MODIFIED => {
                debug!(container = %unit, "Container already stopped");
                Ok(())
            }
            s => Err(Self::api_error(s, &body, Some(unit.as_str()))),
        }
    }

    async fn remove(&self, unit: &UnitHandle, force: bool) -> Result<(), RuntimeError> {
        let path = format!("/containers/{unit}?force={force}");
        let (status, body) = self.send(Method::DELETE, &path, None).await?;
        if status.is_success() {
            Ok(())
        } else {
            warn!(container = %unit, status = %status, "Container removal rejected");
            Err(Self::api_error(status, &body, Some(unit.as_str())))
        }
    }

    async fn inspect(&self, unit: &UnitHandle) -> Result<UnitState, RuntimeError> {
        let path = format!("/containers/{unit}/json");
        let (status, body) = self.send(Method::GET, &path, None).await?;
        if !status.is_success() {
            return Err(Self::api_error(status, &body, Some(unit.as_str())));
        }

        let inspect: ContainerInspect = serde_json::from_slice(&body)
            .map_err(|e| RuntimeError::Unavailable(format!("decode inspect response: {e}")))?;

        Ok(UnitState {
            running: inspect.state.running,
            exit_code: inspect.state.exit_code,
        })
    }
}
