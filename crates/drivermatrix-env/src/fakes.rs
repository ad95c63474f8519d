//! In-memory fakes for the environment traits (testing only)
//!
//! `FakeProvisioner` hands out `FakeEnvironment`s that never touch the
//! network. Failures are injected deterministically: provisioning can fail
//! per kind or label, and once a node swap has started, operations fail at a
//! fixed fraction.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::EnvError;
use crate::{
    Environment, EnvironmentInfo, EnvironmentKind, HealthReport, NodeHealth, Operation,
    OperationReceipt, ProvisionRequest, Provisioner, Result,
};

#[derive(Debug, Default)]
struct FakeState {
    provisioned: Vec<ProvisionRequest>,
    live: BTreeSet<String>,
    teardowns: HashMap<String, usize>,
}

#[derive(Debug, Clone, Default)]
struct FailurePlan {
    provision_kinds: Vec<EnvironmentKind>,
    provision_labels: Vec<String>,
    provision_delay: Duration,
    upgrade_error_rate: f64,
    swap_delay: Duration,
    swap_fails_on: Option<usize>,
}

/// Provisioner that records every lifecycle call.
#[derive(Debug, Clone, Default)]
pub struct FakeProvisioner {
    state: Arc<Mutex<FakeState>>,
    plan: FailurePlan,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every provisioning request of `kind`.
    pub fn failing_kind(mut self, kind: EnvironmentKind) -> Self {
        self.plan.provision_kinds.push(kind);
        self
    }

    /// Fail provisioning requests whose label contains `fragment`.
    pub fn failing_label(mut self, fragment: impl Into<String>) -> Self {
        self.plan.provision_labels.push(fragment.into());
        self
    }

    pub fn with_provision_delay(mut self, delay: Duration) -> Self {
        self.plan.provision_delay = delay;
        self
    }

    /// Fraction of operations that fail once any node swap has begun.
    pub fn with_upgrade_error_rate(mut self, rate: f64) -> Self {
        self.plan.upgrade_error_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_swap_delay(mut self, delay: Duration) -> Self {
        self.plan.swap_delay = delay;
        self
    }

    /// Make swapping `node` fail.
    pub fn failing_swap(mut self, node: usize) -> Self {
        self.plan.swap_fails_on = Some(node);
        self
    }

    /// Number of environments successfully provisioned.
    pub fn provisioned_count(&self) -> usize {
        self.lock().provisioned.len()
    }

    pub fn provisioned(&self) -> Vec<ProvisionRequest> {
        self.lock().provisioned.clone()
    }

    /// Number of environments provisioned and not yet torn down.
    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    /// Number of teardown calls observed for `label`.
    pub fn teardown_count(&self, label: &str) -> usize {
        self.lock().teardowns.get(label).copied().unwrap_or(0)
    }

    /// Teardown calls for every label ever provisioned.
    pub fn teardown_counts(&self) -> HashMap<String, usize> {
        let state = self.lock();
        state
            .provisioned
            .iter()
            .map(|req| {
                let count = state.teardowns.get(&req.label).copied().unwrap_or(0);
                (req.label.clone(), count)
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn provision(&self, request: &ProvisionRequest) -> Result<Arc<dyn Environment>> {
        if !self.plan.provision_delay.is_zero() {
            tokio::time::sleep(self.plan.provision_delay).await;
        }
        let fails = self.plan.provision_kinds.contains(&request.kind)
            || self
                .plan
                .provision_labels
                .iter()
                .any(|fragment| request.label.contains(fragment.as_str()));
        if fails {
            return Err(EnvError::CommandFailed {
                command: format!("provision {}", request.label),
                stderr: "injected provisioning failure".to_string(),
            });
        }

        {
            let mut state = self.lock();
            state.provisioned.push(request.clone());
            state.live.insert(request.label.clone());
        }

        let nodes = request.nodes.max(1);
        Ok(Arc::new(FakeEnvironment {
            info: EnvironmentInfo {
                kind: request.kind,
                label: request.label.clone(),
                server_version: request.server_version.clone(),
                contact_points: (1..=nodes).map(|n| format!("127.0.0.{}:9042", n)).collect(),
            },
            versions: Mutex::new(vec![request.server_version.clone(); nodes]),
            state: self.state.clone(),
            plan: self.plan.clone(),
            swap_started: AtomicBool::new(false),
            upgrade_ops: AtomicU64::new(0),
            ops: AtomicU64::new(0),
        }))
    }
}

/// Environment produced by [`FakeProvisioner`].
#[derive(Debug)]
pub struct FakeEnvironment {
    info: EnvironmentInfo,
    versions: Mutex<Vec<String>>,
    state: Arc<Mutex<FakeState>>,
    plan: FailurePlan,
    swap_started: AtomicBool,
    upgrade_ops: AtomicU64,
    ops: AtomicU64,
}

impl FakeEnvironment {
    /// Total operations issued against this environment.
    pub fn operations(&self) -> u64 {
        self.ops.load(Ordering::SeqCst)
    }

    // Deterministic fraction: op k fails when floor((k+1)*rate) > floor(k*rate).
    fn upgrade_op_fails(&self) -> bool {
        let rate = self.plan.upgrade_error_rate;
        if rate <= 0.0 {
            return false;
        }
        let k = self.upgrade_ops.fetch_add(1, Ordering::SeqCst) as f64;
        ((k + 1.0) * rate).floor() > (k * rate).floor()
    }
}

#[async_trait]
impl Environment for FakeEnvironment {
    fn info(&self) -> &EnvironmentInfo {
        &self.info
    }

    fn node_count(&self) -> usize {
        self.info.contact_points.len()
    }

    async fn issue_operation(&self, op: Operation) -> Result<OperationReceipt> {
        let n = self.ops.fetch_add(1, Ordering::SeqCst);
        if self.swap_started.load(Ordering::SeqCst) && self.upgrade_op_fails() {
            return Err(EnvError::Unavailable(format!(
                "injected {} failure on {}",
                op.as_str(),
                self.info.label
            )));
        }
        Ok(OperationReceipt {
            node: (n as usize) % self.node_count(),
            latency: Duration::from_micros(100),
        })
    }

    async fn observe_health(&self) -> Result<HealthReport> {
        let versions = self.versions.lock().unwrap().clone();
        Ok(HealthReport {
            nodes: versions
                .into_iter()
                .enumerate()
                .map(|(node, version)| NodeHealth {
                    node,
                    up: true,
                    version,
                })
                .collect(),
        })
    }

    async fn swap_node(&self, node: usize, target_version: &str) -> Result<()> {
        if self.info.kind != EnvironmentKind::Cluster {
            return Err(EnvError::Unsupported {
                capability: "node swap",
                kind: self.info.kind.as_str(),
            });
        }
        let nodes = self.node_count();
        if node >= nodes {
            return Err(EnvError::NoSuchNode { node, nodes });
        }
        self.swap_started.store(true, Ordering::SeqCst);
        if !self.plan.swap_delay.is_zero() {
            tokio::time::sleep(self.plan.swap_delay).await;
        }
        if self.plan.swap_fails_on == Some(node) {
            return Err(EnvError::CommandFailed {
                command: format!("swap node{}", node + 1),
                stderr: "injected swap failure".to_string(),
            });
        }
        self.versions.lock().unwrap()[node] = target_version.to_string();
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        *state.teardowns.entry(self.info.label.clone()).or_insert(0) += 1;
        if !state.live.remove(&self.info.label) {
            return Err(EnvError::TornDown(self.info.label.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_provision_failure() {
        let provisioner = FakeProvisioner::new().failing_kind(EnvironmentKind::Simulator);
        let request = ProvisionRequest::simulator("v1-simulation", "4.0", 1);
        assert!(provisioner.provision(&request).await.is_err());
        assert_eq!(provisioner.provisioned_count(), 0);

        let request = ProvisionRequest::cluster("v1-standard", "4.0", 1);
        assert!(provisioner.provision(&request).await.is_ok());
    }

    #[tokio::test]
    async fn test_error_rate_applies_only_after_swap() {
        let provisioner = FakeProvisioner::new().with_upgrade_error_rate(0.5);
        let env = provisioner
            .provision(&ProvisionRequest::cluster("u", "3.11", 2))
            .await
            .unwrap();

        for _ in 0..10 {
            assert!(env.issue_operation(Operation::Read).await.is_ok());
        }

        env.swap_node(0, "4.0").await.unwrap();
        let mut failures = 0;
        for _ in 0..10 {
            if env.issue_operation(Operation::Write).await.is_err() {
                failures += 1;
            }
        }
        assert_eq!(failures, 5);

        let health = env.observe_health().await.unwrap();
        assert_eq!(health.nodes[0].version, "4.0");
        assert_eq!(health.nodes[1].version, "3.11");
    }

    #[tokio::test]
    async fn test_double_teardown_is_counted() {
        let provisioner = FakeProvisioner::new();
        let env = provisioner
            .provision(&ProvisionRequest::cluster("t", "4.0", 1))
            .await
            .unwrap();
        env.teardown().await.unwrap();
        assert!(env.teardown().await.is_err());
        assert_eq!(provisioner.teardown_count("t"), 2);
    }

    #[tokio::test]
    async fn test_simulator_cannot_swap() {
        let provisioner = FakeProvisioner::new();
        let env = provisioner
            .provision(&ProvisionRequest::simulator("s", "4.0", 1))
            .await
            .unwrap();
        let err = env.swap_node(0, "4.1").await.unwrap_err();
        assert!(matches!(err, EnvError::Unsupported { .. }));
    }
}
