//! Error types for drivermatrix-env

use thiserror::Error;

/// Errors that can occur while provisioning or driving a test environment
#[derive(Error, Debug)]
pub enum EnvError {
    /// Cluster manager or simulator binary not found
    #[error("Environment tool not found in PATH: {0}")]
    ToolNotFound(String),

    /// External command exited unsuccessfully
    #[error("Command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// Environment did not become ready in time
    #[error("Environment {label} not ready after {timeout_ms}ms")]
    ProvisionTimeout { label: String, timeout_ms: u64 },

    /// Operation against the environment could not be served
    #[error("Node unavailable: {0}")]
    Unavailable(String),

    /// Capability not offered by this environment kind
    #[error("{capability} is not supported by {kind} environments")]
    Unsupported {
        capability: &'static str,
        kind: &'static str,
    },

    /// Node index outside the provisioned topology
    #[error("Node {node} does not exist (cluster has {nodes} nodes)")]
    NoSuchNode { node: usize, nodes: usize },

    /// Every address slot for this environment kind is held by a live environment
    #[error("No free {kind} address: all {slots} slots are in use")]
    AddressesExhausted { kind: &'static str, slots: u32 },

    /// The background provisioning task died before reporting
    #[error("Provisioning task for {label} failed: {reason}")]
    ProvisionTask { label: String, reason: String },

    /// Environment already torn down
    #[error("Environment {0} has already been torn down")]
    TornDown(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
