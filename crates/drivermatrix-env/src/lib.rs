//! drivermatrix-env: Test Environments for the Build Matrix
//!
//! This crate provides the environment layer consumed by the test tiers.
//! Database clusters and protocol simulators sit behind one capability
//! interface (provision / issue-operation / observe-health / teardown) so
//! the orchestrator and the upgrade harness never special-case a backend.
//!
//! ## Implementations
//!
//! - [`cluster::ClusterEnvironment`]: a local multi-node cluster driven
//!   through a cluster-manager CLI (create, node swap, remove).
//! - [`simulator::SimulatorEnvironment`]: a protocol simulator child process.
//! - [`fakes`]: in-memory environments for tests.

pub mod cluster;
pub mod error;
pub mod fakes;
pub mod lease;
pub mod simulator;
pub mod slots;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub use cluster::{ClusterEnvironment, ClusterManagerConfig};
pub use error::EnvError;
pub use lease::EnvironmentLease;
pub use simulator::{SimulatorConfig, SimulatorEnvironment};
pub use slots::{Slot, SlotPool};

/// Result type for environment operations
pub type Result<T> = std::result::Result<T, EnvError>;

/// Which kind of environment a tier needs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    /// Real multi-node database cluster
    Cluster,
    /// Protocol simulator emulating server wire behavior
    Simulator,
}

impl EnvironmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentKind::Cluster => "cluster",
            EnvironmentKind::Simulator => "simulator",
        }
    }
}

impl std::fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to stand up one environment for one variant tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub kind: EnvironmentKind,
    /// Server version to install (or emulate, for the simulator)
    pub server_version: String,
    /// Number of nodes in the topology
    pub nodes: usize,
    /// Unique label, used for cluster names and log fields
    pub label: String,
}

impl ProvisionRequest {
    pub fn cluster(label: impl Into<String>, server_version: impl Into<String>, nodes: usize) -> Self {
        Self {
            kind: EnvironmentKind::Cluster,
            server_version: server_version.into(),
            nodes,
            label: label.into(),
        }
    }

    pub fn simulator(label: impl Into<String>, server_version: impl Into<String>, nodes: usize) -> Self {
        Self {
            kind: EnvironmentKind::Simulator,
            server_version: server_version.into(),
            nodes,
            label: label.into(),
        }
    }
}

/// Static description of a provisioned environment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentInfo {
    pub kind: EnvironmentKind,
    pub label: String,
    pub server_version: String,
    /// `host:port` pairs clients connect to
    pub contact_points: Vec<String>,
}

/// Representative client operation issued against an environment
///
/// Real environments serve an operation by opening a connection to a
/// node's native-protocol port: a receipt proves the node is reachable,
/// not that a query would succeed. Error rates measured during an upgrade
/// are therefore reachability error rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
        }
    }
}

/// Acknowledgement of a served operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationReceipt {
    /// Index of the node that served the operation
    pub node: usize,
    pub latency: Duration,
}

/// Health of a single node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeHealth {
    pub node: usize,
    pub up: bool,
    pub version: String,
}

/// Health snapshot of a whole environment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthReport {
    pub nodes: Vec<NodeHealth>,
}

impl HealthReport {
    /// Whether every node is up
    pub fn all_up(&self) -> bool {
        !self.nodes.is_empty() && self.nodes.iter().all(|n| n.up)
    }

    /// Whether every node is up and running `version`
    pub fn converged_on(&self, version: &str) -> bool {
        self.all_up() && self.nodes.iter().all(|n| n.version == version)
    }
}

/// Capability interface over a provisioned environment.
#[async_trait]
pub trait Environment: Send + Sync {
    fn info(&self) -> &EnvironmentInfo;

    /// Number of nodes in the topology
    fn node_count(&self) -> usize;

    async fn issue_operation(&self, op: Operation) -> Result<OperationReceipt>;

    async fn observe_health(&self) -> Result<HealthReport>;

    /// Replace one node in place with `target_version`.
    async fn swap_node(&self, node: usize, target_version: &str) -> Result<()> {
        let _ = (node, target_version);
        Err(EnvError::Unsupported {
            capability: "node swap",
            kind: self.info().kind.as_str(),
        })
    }

    async fn teardown(&self) -> Result<()>;
}

/// Stands up environments on request.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, request: &ProvisionRequest) -> Result<Arc<dyn Environment>>;
}

/// Provisioner backed by a cluster-manager CLI and a simulator binary
///
/// Clones share the address pools, so every environment one provisioner
/// (or any clone of it) hands out has addresses of its own.
#[derive(Debug, Clone)]
pub struct ExternalProvisioner {
    pub cluster: ClusterManagerConfig,
    pub simulator: SimulatorConfig,
    cluster_slots: SlotPool,
    simulator_ports: SlotPool,
}

impl ExternalProvisioner {
    pub fn new(cluster: ClusterManagerConfig, simulator: SimulatorConfig) -> Self {
        let cluster_slots = SlotPool::new(cluster.first_ip_slot, cluster.ip_slots);
        let simulator_ports = SlotPool::new(u32::from(simulator.port), u32::from(simulator.ports));
        Self {
            cluster,
            simulator,
            cluster_slots,
            simulator_ports,
        }
    }
}

#[async_trait]
impl Provisioner for ExternalProvisioner {
    async fn provision(&self, request: &ProvisionRequest) -> Result<Arc<dyn Environment>> {
        match request.kind {
            EnvironmentKind::Cluster => {
                let slot = self.cluster_slots.claim().ok_or(EnvError::AddressesExhausted {
                    kind: EnvironmentKind::Cluster.as_str(),
                    slots: self.cluster.ip_slots,
                })?;
                let env = ClusterEnvironment::create(self.cluster.clone(), request, slot).await?;
                Ok(Arc::new(env))
            }
            EnvironmentKind::Simulator => {
                let simulator = &self.simulator;
                let port = self
                    .simulator_ports
                    .claim_where(|port| u16::try_from(port).is_ok_and(|port| simulator.port_is_free(port)))
                    .ok_or(EnvError::AddressesExhausted {
                        kind: EnvironmentKind::Simulator.as_str(),
                        slots: u32::from(simulator.ports),
                    })?;
                let env = SimulatorEnvironment::start(simulator.clone(), request, port).await?;
                Ok(Arc::new(env))
            }
        }
    }
}
