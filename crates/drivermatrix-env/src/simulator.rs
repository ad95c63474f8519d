//! Protocol simulator environments
//!
//! The simulator is an external process that speaks the server wire
//! protocol for a configured topology. It is started per tier on a port
//! claimed from a shared pool, and killed on teardown.

use crate::error::EnvError;
use crate::slots::Slot;
use crate::{
    Environment, EnvironmentInfo, EnvironmentKind, HealthReport, NodeHealth, Operation,
    OperationReceipt, ProvisionRequest, Result,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Simulator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Simulator executable (or launcher script)
    pub binary: PathBuf,
    /// Arguments; `{port}`, `{version}` and `{nodes}` are substituted
    pub args: Vec<String>,
    pub host: String,
    /// First port of the pool simulators are started on
    pub port: u16,
    /// Number of ports in the pool, and so of simulators alive at once
    pub ports: u16,
    /// Upper bound on readiness, in milliseconds
    pub start_timeout_ms: u64,
    /// Delay between readiness checks, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("simulator"),
            args: vec![
                "--port".to_string(),
                "{port}".to_string(),
                "--server-version".to_string(),
                "{version}".to_string(),
                "--nodes".to_string(),
                "{nodes}".to_string(),
            ],
            host: "127.0.0.1".to_string(),
            port: 8187,
            ports: 100,
            start_timeout_ms: 60_000,
            poll_interval_ms: 250,
        }
    }
}

impl SimulatorConfig {
    fn render_args(&self, request: &ProvisionRequest, port: u16) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{port}", &port.to_string())
                    .replace("{version}", &request.server_version)
                    .replace("{nodes}", &request.nodes.max(1).to_string())
            })
            .collect()
    }

    fn address(&self, port: u16) -> String {
        format!("{}:{}", self.host, port)
    }

    /// Whether nothing is listening on `port` of the simulator host.
    pub fn port_is_free(&self, port: u16) -> bool {
        std::net::TcpListener::bind((self.host.as_str(), port)).is_ok()
    }
}

/// A running simulator process
#[derive(Debug)]
pub struct SimulatorEnvironment {
    info: EnvironmentInfo,
    nodes: usize,
    child: Mutex<Option<Child>>,
    _port: Slot,
}

impl SimulatorEnvironment {
    /// Spawn the simulator on the port held by `port` and wait until that
    /// port accepts connections.
    pub async fn start(config: SimulatorConfig, request: &ProvisionRequest, port: Slot) -> Result<Self> {
        let number = u16::try_from(port.value())
            .map_err(|_| EnvError::Unavailable(format!("port slot {} is not a TCP port", port.value())))?;
        info!(label = %request.label, binary = ?config.binary, port = number, "Starting protocol simulator");

        let mut child = Command::new(&config.binary)
            .args(config.render_args(request, number))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    EnvError::ToolNotFound(config.binary.display().to_string())
                } else {
                    EnvError::Io(e)
                }
            })?;

        let address = config.address(number);
        let deadline = Instant::now() + Duration::from_millis(config.start_timeout_ms);
        loop {
            if TcpStream::connect(&address).await.is_ok() {
                break;
            }
            if let Some(status) = child.try_wait()? {
                return Err(EnvError::CommandFailed {
                    command: config.binary.display().to_string(),
                    stderr: format!("simulator exited during startup with {}", status),
                });
            }
            if Instant::now() >= deadline {
                child.kill().await.ok();
                return Err(EnvError::ProvisionTimeout {
                    label: request.label.clone(),
                    timeout_ms: config.start_timeout_ms,
                });
            }
            tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)).await;
        }
        debug!(label = %request.label, %address, "Simulator ready");

        Ok(Self {
            info: EnvironmentInfo {
                kind: EnvironmentKind::Simulator,
                label: request.label.clone(),
                server_version: request.server_version.clone(),
                contact_points: vec![address],
            },
            nodes: request.nodes.max(1),
            child: Mutex::new(Some(child)),
            _port: port,
        })
    }

    async fn running(&self) -> Result<bool> {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => Ok(child.try_wait()?.is_none()),
            None => Err(EnvError::TornDown(self.info.label.clone())),
        }
    }
}

#[async_trait]
impl Environment for SimulatorEnvironment {
    fn info(&self) -> &EnvironmentInfo {
        &self.info
    }

    fn node_count(&self) -> usize {
        self.nodes
    }

    /// Connects to the simulator's port. A receipt means the simulator
    /// accepted a connection; no query is executed.
    async fn issue_operation(&self, op: Operation) -> Result<OperationReceipt> {
        if !self.running().await? {
            return Err(EnvError::Unavailable(format!(
                "simulator {} exited before {}",
                self.info.label,
                op.as_str()
            )));
        }
        let start = Instant::now();
        TcpStream::connect(&self.info.contact_points[0])
            .await
            .map_err(|e| EnvError::Unavailable(e.to_string()))?;
        Ok(OperationReceipt {
            node: 0,
            latency: start.elapsed(),
        })
    }

    async fn observe_health(&self) -> Result<HealthReport> {
        let up = self.running().await?
            && TcpStream::connect(&self.info.contact_points[0]).await.is_ok();
        let nodes = (0..self.nodes)
            .map(|node| NodeHealth {
                node,
                up,
                version: self.info.server_version.clone(),
            })
            .collect();
        Ok(HealthReport { nodes })
    }

    async fn teardown(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        let mut child = guard
            .take()
            .ok_or_else(|| EnvError::TornDown(self.info.label.clone()))?;
        info!(label = %self.info.label, "Stopping protocol simulator");
        if child.try_wait()?.is_none() {
            child.kill().await?;
        }
        Ok(())
    }
}
