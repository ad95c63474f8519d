//! Rolling-upgrade verification harness.
//!
//! Drives a live cluster through
//! `baseline-running -> swap-in-progress -> post-swap-running -> verified | failed`,
//! replacing nodes one at a time while representative operations keep
//! flowing. The error rate and the longest unavailability window observed
//! while nodes are being swapped are checked against configured bounds.

use crate::error::ConfigurationError;
use drivermatrix_env::{Environment, Operation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// `[upgrade]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpgradeConfig {
    /// Server version to the version its nodes are upgraded to.
    pub paths: BTreeMap<String, String>,
    /// Highest tolerated failed-operation fraction per phase.
    pub max_error_rate: f64,
    /// Longest tolerated run of consecutive failures, in milliseconds.
    pub max_unavailable_window_ms: Option<u64>,
    /// Operations issued in the baseline and post-swap phases.
    pub operations_per_phase: u32,
    /// Pause between operations.
    pub operation_interval_ms: u64,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            paths: BTreeMap::new(),
            max_error_rate: 0.05,
            max_unavailable_window_ms: None,
            operations_per_phase: 50,
            operation_interval_ms: 10,
        }
    }
}

impl UpgradeConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(0.0..=1.0).contains(&self.max_error_rate) {
            return Err(ConfigurationError::Invalid(format!(
                "upgrade.max_error_rate must be within [0, 1], got {}",
                self.max_error_rate
            )));
        }
        if self.operations_per_phase == 0 {
            return Err(ConfigurationError::Invalid(
                "upgrade.operations_per_phase must be at least 1".to_string(),
            ));
        }
        for (from, to) in &self.paths {
            if to.trim().is_empty() {
                return Err(ConfigurationError::Invalid(format!(
                    "upgrade path from {} has an empty target",
                    from
                )));
            }
        }
        Ok(())
    }

    /// Target version for a cluster running `server`, if an upgrade path exists.
    pub fn target_for(&self, server: &str) -> Option<&str> {
        self.paths.get(server).map(String::as_str)
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.operation_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum UpgradeState {
    BaselineRunning,
    SwapInProgress,
    PostSwapRunning,
    Verified,
    Failed,
}

impl UpgradeState {
    pub fn name(&self) -> &'static str {
        match self {
            UpgradeState::BaselineRunning => "baseline-running",
            UpgradeState::SwapInProgress => "swap-in-progress",
            UpgradeState::PostSwapRunning => "post-swap-running",
            UpgradeState::Verified => "verified",
            UpgradeState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Operation counters for one phase.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PhaseStats {
    pub issued: u64,
    pub failed: u64,
    pub longest_unavailable_ms: u64,
}

impl PhaseStats {
    pub fn error_rate(&self) -> f64 {
        if self.issued == 0 {
            0.0
        } else {
            self.failed as f64 / self.issued as f64
        }
    }
}

/// Outcome of one rolling upgrade.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpgradeReport {
    pub from_version: String,
    pub target_version: String,
    pub final_state: UpgradeState,
    pub transitions: Vec<UpgradeState>,
    pub phases: BTreeMap<String, PhaseStats>,
    pub detail: Option<String>,
}

impl UpgradeReport {
    pub fn verified(&self) -> bool {
        self.final_state == UpgradeState::Verified
    }

    pub fn phase(&self, state: UpgradeState) -> Option<&PhaseStats> {
        self.phases.get(state.name())
    }
}

/// Tracks consecutive failures to measure unavailability windows.
#[derive(Default)]
struct Tally {
    stats: PhaseStats,
    outage_started: Option<Instant>,
}

impl Tally {
    fn record(&mut self, ok: bool) {
        self.stats.issued += 1;
        if ok {
            self.close_outage();
        } else {
            self.stats.failed += 1;
            self.outage_started.get_or_insert_with(Instant::now);
        }
    }

    fn close_outage(&mut self) {
        if let Some(started) = self.outage_started.take() {
            let window = started.elapsed().as_millis() as u64;
            self.stats.longest_unavailable_ms = self.stats.longest_unavailable_ms.max(window);
        }
    }

    fn finish(mut self) -> PhaseStats {
        self.close_outage();
        self.stats
    }
}

/// Runs rolling upgrades against environments that support node swaps.
#[derive(Debug, Clone)]
pub struct UpgradeHarness {
    config: UpgradeConfig,
}

struct Run {
    report: UpgradeReport,
}

impl Run {
    fn enter(&mut self, state: UpgradeState) {
        debug!(state = %state, "Upgrade state transition");
        self.report.transitions.push(state);
        self.report.final_state = state;
    }

    fn fail(mut self, detail: String) -> UpgradeReport {
        warn!(detail = %detail, "Rolling upgrade failed");
        self.enter(UpgradeState::Failed);
        self.report.detail = Some(detail);
        self.report
    }
}

impl UpgradeHarness {
    pub fn new(config: UpgradeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &UpgradeConfig {
        &self.config
    }

    /// Upgrade every node of `env` to `target`. Never returns an error:
    /// every problem ends the state machine in `failed`.
    pub async fn run(&self, env: &dyn Environment, target: &str) -> UpgradeReport {
        let from_version = env.info().server_version.clone();
        let mut run = Run {
            report: UpgradeReport {
                from_version: from_version.clone(),
                target_version: target.to_string(),
                final_state: UpgradeState::BaselineRunning,
                transitions: Vec::new(),
                phases: BTreeMap::new(),
                detail: None,
            },
        };

        info!(from = %from_version, to = %target, nodes = env.node_count(), "Starting rolling upgrade");

        run.enter(UpgradeState::BaselineRunning);
        let baseline = self.steady_phase(env).await;
        run.report.phases.insert(UpgradeState::BaselineRunning.name().to_string(), baseline);
        if let Some(violation) = self.violation("baseline", &baseline) {
            return run.fail(violation);
        }

        run.enter(UpgradeState::SwapInProgress);
        let (swap, swap_error) = self.swap_phase(env, target).await;
        run.report.phases.insert(UpgradeState::SwapInProgress.name().to_string(), swap);
        if let Some(error) = swap_error {
            return run.fail(error);
        }
        if let Some(violation) = self.violation("swap", &swap) {
            return run.fail(violation);
        }
        match env.observe_health().await {
            Ok(health) if health.all_up() && health.converged_on(target) => {}
            Ok(health) => {
                return run.fail(format!(
                    "cluster did not converge on {}: {:?}",
                    target,
                    health
                        .nodes
                        .iter()
                        .map(|n| format!("node{}={}{}", n.node + 1, n.version, if n.up { "" } else { "(down)" }))
                        .collect::<Vec<_>>()
                ))
            }
            Err(e) => return run.fail(format!("health check after swap failed: {}", e)),
        }

        run.enter(UpgradeState::PostSwapRunning);
        let post = self.steady_phase(env).await;
        run.report.phases.insert(UpgradeState::PostSwapRunning.name().to_string(), post);
        if let Some(violation) = self.violation("post-swap", &post) {
            return run.fail(violation);
        }

        run.enter(UpgradeState::Verified);
        info!(to = %target, "Rolling upgrade verified");
        run.report
    }

    fn violation(&self, phase: &str, stats: &PhaseStats) -> Option<String> {
        let rate = stats.error_rate();
        if rate > self.config.max_error_rate {
            return Some(format!(
                "{} error rate {:.3} exceeds {:.3} ({} of {} operations failed)",
                phase, rate, self.config.max_error_rate, stats.failed, stats.issued
            ));
        }
        if let Some(max) = self.config.max_unavailable_window_ms {
            if stats.longest_unavailable_ms > max {
                return Some(format!(
                    "{} unavailability window {}ms exceeds {}ms",
                    phase, stats.longest_unavailable_ms, max
                ));
            }
        }
        None
    }

    async fn steady_phase(&self, env: &dyn Environment) -> PhaseStats {
        let mut tally = Tally::default();
        for i in 0..self.config.operations_per_phase {
            let op = if i % 2 == 0 { Operation::Write } else { Operation::Read };
            tally.record(env.issue_operation(op).await.is_ok());
            tokio::time::sleep(self.config.interval()).await;
        }
        tally.finish()
    }

    /// Swap nodes one by one while a load loop keeps issuing operations.
    async fn swap_phase(&self, env: &dyn Environment, target: &str) -> (PhaseStats, Option<String>) {
        let nodes = env.node_count().max(1);
        let per_node = (self.config.operations_per_phase as usize / nodes).max(1) as u64;
        let mut tally = Tally::default();

        for node in 0..env.node_count() {
            let done = AtomicBool::new(false);
            let swap = async {
                let result = env.swap_node(node, target).await;
                done.store(true, Ordering::SeqCst);
                result
            };
            let load = async {
                let mut local = Tally::default();
                let mut issued = 0u64;
                while !done.load(Ordering::SeqCst) || issued < per_node {
                    let op = if issued % 2 == 0 { Operation::Write } else { Operation::Read };
                    local.record(env.issue_operation(op).await.is_ok());
                    issued += 1;
                    tokio::time::sleep(self.config.interval()).await;
                }
                local.finish()
            };

            let (result, stats) = tokio::join!(swap, load);
            tally.stats.issued += stats.issued;
            tally.stats.failed += stats.failed;
            tally.stats.longest_unavailable_ms =
                tally.stats.longest_unavailable_ms.max(stats.longest_unavailable_ms);

            if let Err(e) = result {
                return (tally.finish(), Some(format!("swap of node{} failed: {}", node + 1, e)));
            }
            debug!(node = node + 1, issued = stats.issued, failed = stats.failed, "Node swapped");
        }
        (tally.finish(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(UpgradeConfig::default().validate().is_ok());
        let config = UpgradeConfig {
            max_error_rate: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = UpgradeConfig {
            operations_per_phase: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_target_for() {
        let mut config = UpgradeConfig::default();
        config.paths.insert("3.11".to_string(), "4.0".to_string());
        assert_eq!(config.target_for("3.11"), Some("4.0"));
        assert_eq!(config.target_for("4.0"), None);
    }

    #[test]
    fn test_tally_tracks_outages() {
        let mut tally = Tally::default();
        tally.record(true);
        tally.record(false);
        tally.record(false);
        tally.record(true);
        let stats = tally.finish();
        assert_eq!(stats.issued, 4);
        assert_eq!(stats.failed, 2);
        assert!((stats.error_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(UpgradeState::SwapInProgress.to_string(), "swap-in-progress");
        let json = serde_json::to_string(&UpgradeState::PostSwapRunning).unwrap();
        assert_eq!(json, "\"post-swap-running\"");
    }
}
