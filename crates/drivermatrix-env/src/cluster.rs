//! Local database clusters driven through a cluster-manager CLI
//!
//! The manager (`ccm`-style) owns installation and version management.
//! This module only issues its lifecycle commands and connects to the
//! native-protocol port of each node.
//!
//! Clusters alive at the same time never share state: each one claims an
//! address slot (nodes bind `<ip_base><slot>.<n>`) and keeps its manager
//! state in its own config directory, so no command depends on the
//! manager's notion of a "current" cluster.

use crate::error::EnvError;
use crate::slots::Slot;
use crate::{
    Environment, EnvironmentInfo, EnvironmentKind, HealthReport, NodeHealth, Operation,
    OperationReceipt, ProvisionRequest, Result,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Cluster manager settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterManagerConfig {
    /// Cluster manager executable
    pub binary: String,
    /// Nodes bind to `<ip_base><slot>.<n>` for n starting at 1
    pub ip_base: String,
    /// First address slot handed to a cluster
    pub first_ip_slot: u32,
    /// Number of clusters that may be alive at once
    pub ip_slots: u32,
    /// Native protocol port on every node
    pub native_port: u16,
    /// Each cluster keeps its manager state in `<config_root>/<cluster name>`
    pub config_root: PathBuf,
    /// Upper bound on cluster start, in milliseconds
    pub start_timeout_ms: u64,
    /// Upper bound on a single node connection, in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ClusterManagerConfig {
    fn default() -> Self {
        Self {
            binary: "ccm".to_string(),
            ip_base: "127.0.".to_string(),
            first_ip_slot: 1,
            ip_slots: 254,
            native_port: 9042,
            config_root: std::env::temp_dir().join("drivermatrix-ccm"),
            start_timeout_ms: 600_000,
            connect_timeout_ms: 2_000,
        }
    }
}

impl ClusterManagerConfig {
    /// `-i` prefix for the cluster holding `slot`, e.g. `127.0.3.`
    pub fn ip_prefix(&self, slot: &Slot) -> String {
        format!("{}{}.", self.ip_base, slot.value())
    }
}

/// Manager commands scoped to one cluster's config directory
#[derive(Debug, Clone)]
struct Manager {
    binary: String,
    config_dir: PathBuf,
}

impl Manager {
    async fn run(&self, args: &[&str]) -> Result<String> {
        let mut argv: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        argv.push(format!("--config-dir={}", self.config_dir.display()));
        run_manager(&self.binary, &argv).await
    }
}

/// A running local cluster
#[derive(Debug)]
pub struct ClusterEnvironment {
    config: ClusterManagerConfig,
    manager: Manager,
    name: String,
    info: EnvironmentInfo,
    versions: Mutex<Vec<String>>,
    next_node: AtomicUsize,
    torn_down: AtomicBool,
    _slot: Slot,
}

impl ClusterEnvironment {
    /// Create and start a cluster for `request` on the addresses of `slot`.
    ///
    /// A cluster that fails to start is removed before the error is returned.
    pub async fn create(config: ClusterManagerConfig, request: &ProvisionRequest, slot: Slot) -> Result<Self> {
        let name = cluster_name(&request.label);
        let nodes = request.nodes.max(1);
        let ip_prefix = config.ip_prefix(&slot);
        let manager = Manager {
            binary: config.binary.clone(),
            config_dir: config.config_root.join(&name),
        };
        info!(cluster = %name, version = %request.server_version, nodes, ip_prefix = %ip_prefix, "Creating cluster");

        tokio::fs::create_dir_all(&manager.config_dir).await?;
        let node_count = nodes.to_string();
        let create_args = [
            "create",
            name.as_str(),
            "-v",
            request.server_version.as_str(),
            "-n",
            node_count.as_str(),
            "-i",
            ip_prefix.as_str(),
        ];
        if let Err(e) = manager.run(&create_args).await {
            remove_config_dir(&manager).await;
            return Err(e);
        }

        let start_args = ["start", "--wait-for-binary-proto"];
        let start = manager.run(&start_args);
        let started = tokio::time::timeout(Duration::from_millis(config.start_timeout_ms), start).await;

        let failure = match started {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(EnvError::ProvisionTimeout {
                label: request.label.clone(),
                timeout_ms: config.start_timeout_ms,
            }),
        };
        if let Some(err) = failure {
            if let Err(cleanup) = manager.run(&["remove", name.as_str()]).await {
                warn!(cluster = %name, error = %cleanup, "Failed to remove cluster after start failure");
            }
            remove_config_dir(&manager).await;
            return Err(err);
        }

        let contact_points = (1..=nodes)
            .map(|n| format!("{}{}:{}", ip_prefix, n, config.native_port))
            .collect();

        Ok(Self {
            info: EnvironmentInfo {
                kind: EnvironmentKind::Cluster,
                label: request.label.clone(),
                server_version: request.server_version.clone(),
                contact_points,
            },
            versions: Mutex::new(vec![request.server_version.clone(); nodes]),
            next_node: AtomicUsize::new(0),
            torn_down: AtomicBool::new(false),
            config,
            manager,
            name,
            _slot: slot,
        })
    }

    /// Cluster name as known to the manager
    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_live(&self) -> Result<()> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(EnvError::TornDown(self.name.clone()));
        }
        Ok(())
    }

    async fn reachable(&self, node: usize) -> bool {
        let addr = &self.info.contact_points[node];
        let limit = Duration::from_millis(self.config.connect_timeout_ms);
        matches!(
            tokio::time::timeout(limit, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

#[async_trait]
impl Environment for ClusterEnvironment {
    fn info(&self) -> &EnvironmentInfo {
        &self.info
    }

    fn node_count(&self) -> usize {
        self.info.contact_points.len()
    }

    /// Connects to a node's native-protocol port. A receipt means the node
    /// accepted a connection; no query is executed.
    async fn issue_operation(&self, op: Operation) -> Result<OperationReceipt> {
        self.check_live()?;
        let nodes = self.node_count();
        let first = self.next_node.fetch_add(1, Ordering::Relaxed);

        // Round-robin, falling through to the next node like a client would.
        for offset in 0..nodes {
            let node = (first + offset) % nodes;
            let start = Instant::now();
            if self.reachable(node).await {
                return Ok(OperationReceipt {
                    node,
                    latency: start.elapsed(),
                });
            }
            debug!(cluster = %self.name, node, op = op.as_str(), "Node did not accept operation");
        }

        Err(EnvError::Unavailable(format!(
            "no node of {} accepted {}",
            self.name,
            op.as_str()
        )))
    }

    async fn observe_health(&self) -> Result<HealthReport> {
        self.check_live()?;
        let versions = self
            .versions
            .lock()
            .map_err(|_| EnvError::Unavailable("version table poisoned".to_string()))?
            .clone();

        let mut nodes = Vec::with_capacity(versions.len());
        for (node, version) in versions.into_iter().enumerate() {
            nodes.push(NodeHealth {
                node,
                up: self.reachable(node).await,
                version,
            });
        }
        Ok(HealthReport { nodes })
    }

    async fn swap_node(&self, node: usize, target_version: &str) -> Result<()> {
        self.check_live()?;
        let nodes = self.node_count();
        if node >= nodes {
            return Err(EnvError::NoSuchNode { node, nodes });
        }
        let node_name = format!("node{}", node + 1);
        info!(cluster = %self.name, node = %node_name, target = %target_version, "Swapping node version");

        self.manager.run(&[node_name.as_str(), "stop"]).await?;
        self.manager
            .run(&[node_name.as_str(), "setdir", "-v", target_version])
            .await?;
        self.manager
            .run(&[node_name.as_str(), "start", "--wait-for-binary-proto"])
            .await?;

        if let Ok(mut versions) = self.versions.lock() {
            versions[node] = target_version.to_string();
        }
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Err(EnvError::TornDown(self.name.clone()));
        }
        info!(cluster = %self.name, "Removing cluster");
        let removed = self.manager.run(&["remove", self.name.as_str()]).await;
        remove_config_dir(&self.manager).await;
        removed.map(|_| ())
    }
}

/// Derive a manager-safe cluster name from a label
pub fn cluster_name(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("dm_{}", cleaned)
}

async fn remove_config_dir(manager: &Manager) {
    if let Err(e) = tokio::fs::remove_dir_all(&manager.config_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(dir = %manager.config_dir.display(), error = %e, "Could not remove cluster config dir");
        }
    }
}

async fn run_manager(binary: &str, args: &[String]) -> Result<String> {
    let output = Command::new(binary)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EnvError::ToolNotFound(binary.to_string())
            } else {
                EnvError::Io(e)
            }
        })?;

    if !output.status.success() {
        return Err(EnvError::CommandFailed {
            command: format!("{} {}", binary, args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::SlotPool;

    fn slot() -> Slot {
        SlotPool::new(7, 1).claim().unwrap()
    }

    #[test]
    fn test_cluster_name_sanitized() {
        assert_eq!(cluster_name("a1b2-standard"), "dm_a1b2_standard");
        assert_eq!(cluster_name("x.y/z"), "dm_x_y_z");
    }

    #[test]
    fn test_default_config() {
        let config = ClusterManagerConfig::default();
        assert_eq!(config.binary, "ccm");
        assert_eq!(config.native_port, 9042);
        assert_eq!(config.ip_prefix(&slot()), "127.0.7.");
    }

    #[tokio::test]
    async fn test_missing_manager_binary() {
        let root = tempfile::tempdir().unwrap();
        let config = ClusterManagerConfig {
            binary: "drivermatrix-no-such-cluster-manager".to_string(),
            config_root: root.path().to_path_buf(),
            ..Default::default()
        };
        let request = ProvisionRequest::cluster("t", "4.0", 1);
        let err = ClusterEnvironment::create(config, &request, slot()).await.unwrap_err();
        assert!(matches!(err, EnvError::ToolNotFound(_)));
        assert!(!root.path().join("dm_t").exists());
    }

    #[tokio::test]
    async fn test_failing_manager_command() {
        let root = tempfile::tempdir().unwrap();
        let config = ClusterManagerConfig {
            binary: "false".to_string(),
            config_root: root.path().to_path_buf(),
            ..Default::default()
        };
        let request = ProvisionRequest::cluster("t", "4.0", 1);
        let err = ClusterEnvironment::create(config, &request, slot()).await.unwrap_err();
        assert!(matches!(err, EnvError::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_operation_is_a_native_port_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let root = tempfile::tempdir().unwrap();
        let config = ClusterManagerConfig {
            binary: "true".to_string(),
            ip_base: "127.0.".to_string(),
            native_port: port,
            config_root: root.path().to_path_buf(),
            connect_timeout_ms: 500,
            ..Default::default()
        };
        let pool = SlotPool::new(0, 1);
        let request = ProvisionRequest::cluster("ops", "4.0", 1);
        let env = ClusterEnvironment::create(config, &request, pool.claim().unwrap())
            .await
            .unwrap();
        assert_eq!(env.info().contact_points, vec![format!("127.0.0.1:{}", port)]);

        let receipt = env.issue_operation(Operation::Write).await.unwrap();
        assert_eq!(receipt.node, 0);

        drop(listener);
        assert!(matches!(
            env.issue_operation(Operation::Read).await,
            Err(EnvError::Unavailable(_))
        ));
    }
}
