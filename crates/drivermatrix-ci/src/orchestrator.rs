//! Test orchestrator: runs a variant's tiers in order, one environment per tier.
//!
//! A tier that fails, errors or times out is recorded and the next tier
//! still runs. Only a provisioning failure or a run cancellation stops the
//! remaining tiers, which are then recorded as `not-run`. Every environment
//! lease is released before the next tier starts.

use crate::build::{verify_acceleration, BuildProduct};
use crate::cancel::CancelToken;
use crate::error::ErrorKind;
use crate::junit::JunitSummary;
use crate::matrix::BuildVariant;
use crate::profile::VariantProfile;
use crate::repair::RepairedArtifact;
use crate::runner::{Placeholders, TierExecution, TierExecutor, TierInvocation};
use crate::tier::{TierConfig, TierKind};
use crate::upgrade::{UpgradeHarness, UpgradeReport};
use drivermatrix_env::{EnvError, Environment, EnvironmentKind, EnvironmentLease, ProvisionRequest, Provisioner};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of one tier for one variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TierStatus {
    Passed,
    Failed,
    Error,
    TimedOut,
    /// Never started: cancelled, aborted chain, or nothing to run.
    NotRun,
}

impl TierStatus {
    pub fn name(&self) -> &'static str {
        match self {
            TierStatus::Passed => "passed",
            TierStatus::Failed => "failed",
            TierStatus::Error => "error",
            TierStatus::TimedOut => "timed-out",
            TierStatus::NotRun => "not-run",
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, TierStatus::Passed)
    }
}

impl std::fmt::Display for TierStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Recorded once per (variant, tier).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierResult {
    pub variant_id: String,
    pub tier: TierKind,
    pub status: TierStatus,
    /// Structured report written by the tier, if any.
    pub report_path: Option<PathBuf>,
    pub duration_ms: u64,
    pub detail: Option<String>,
    pub failure_kind: Option<ErrorKind>,
    pub summary: Option<JunitSummary>,
    pub upgrade: Option<UpgradeReport>,
}

impl TierResult {
    pub fn not_run(variant_id: &str, tier: TierKind, detail: impl Into<String>) -> Self {
        Self {
            variant_id: variant_id.to_string(),
            tier,
            status: TierStatus::NotRun,
            report_path: None,
            duration_ms: 0,
            detail: Some(detail.into()),
            failure_kind: None,
            summary: None,
            upgrade: None,
        }
    }

    fn new(variant_id: &str, tier: TierKind, status: TierStatus) -> Self {
        Self {
            status,
            detail: None,
            ..Self::not_run(variant_id, tier, "")
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.failure_kind = Some(kind);
        self
    }
}

/// What a variant's tiers run against.
#[derive(Debug, Clone, Copy)]
pub struct VariantTarget<'a> {
    pub variant: &'a BuildVariant,
    pub profile: &'a VariantProfile,
    pub product: &'a BuildProduct,
    pub artifact: &'a RepairedArtifact,
    /// Where tier reports and logs go.
    pub report_dir: &'a Path,
}

/// Why the remaining tiers of a variant did not run.
#[derive(Debug)]
pub enum TierHalt {
    Provisioning { tier: TierKind, error: EnvError },
    Cancelled,
}

/// Every tier result of one variant, plus why it stopped early if it did.
#[derive(Debug)]
pub struct TierRun {
    pub results: Vec<TierResult>,
    pub halt: Option<TierHalt>,
}

enum Step {
    Recorded(TierResult),
    Halted(TierResult, TierHalt),
}

#[derive(Clone)]
pub struct TestOrchestrator {
    provisioner: Arc<dyn Provisioner>,
    executor: Arc<dyn TierExecutor>,
    harness: UpgradeHarness,
    provision_timeout: Duration,
    workspace: PathBuf,
}

impl TestOrchestrator {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        executor: Arc<dyn TierExecutor>,
        harness: UpgradeHarness,
        provision_timeout: Duration,
        workspace: PathBuf,
    ) -> Self {
        Self {
            provisioner,
            executor,
            harness,
            provision_timeout,
            workspace,
        }
    }

    /// Run `tiers` in kind order against `target`.
    pub async fn run_tiers(&self, target: &VariantTarget<'_>, tiers: &[TierConfig], cancel: &CancelToken) -> TierRun {
        let variant_id = target.variant.id();
        let mut ordered: Vec<&TierConfig> = tiers.iter().collect();
        ordered.sort_by_key(|tier| tier.kind);

        let mut results = Vec::with_capacity(ordered.len());
        let mut halt = None;
        for tier in ordered {
            if let Some(reason) = &halt {
                let detail = match reason {
                    TierHalt::Provisioning { tier, .. } => format!("skipped: provisioning for {} failed", tier),
                    TierHalt::Cancelled => "skipped: run cancelled".to_string(),
                };
                results.push(TierResult::not_run(&variant_id, tier.kind, detail));
                continue;
            }
            if cancel.is_cancelled() {
                results.push(TierResult::not_run(&variant_id, tier.kind, "skipped: run cancelled"));
                halt = Some(TierHalt::Cancelled);
                continue;
            }

            match self.run_tier(target, tier, cancel).await {
                Step::Recorded(result) => {
                    info!(
                        variant = %variant_id,
                        tier = %tier.kind,
                        status = %result.status,
                        duration_ms = result.duration_ms,
                        "Tier finished"
                    );
                    results.push(result);
                }
                Step::Halted(result, reason) => {
                    warn!(variant = %variant_id, tier = %tier.kind, reason = ?reason, "Variant halted");
                    results.push(result);
                    halt = Some(reason);
                }
            }
        }
        TierRun { results, halt }
    }

    async fn run_tier(&self, target: &VariantTarget<'_>, tier: &TierConfig, cancel: &CancelToken) -> Step {
        let variant_id = target.variant.id();
        let start = Instant::now();

        let upgrade_target = if tier.kind == TierKind::Upgrade {
            match self.harness.config().target_for(&target.profile.server) {
                Some(to) => Some(to.to_string()),
                None => {
                    return Step::Recorded(TierResult::not_run(
                        &variant_id,
                        tier.kind,
                        format!("no upgrade path from server {}", target.profile.server),
                    ))
                }
            }
        } else {
            None
        };

        if target.profile.verify_acceleration {
            if let Err(e) = verify_acceleration(&target.product.location, target.profile.accel) {
                return Step::Recorded(
                    TierResult::new(&variant_id, tier.kind, TierStatus::Error)
                        .with_detail(e.to_string())
                        .with_kind(ErrorKind::TestTierFailure),
                );
            }
        }

        let lease = match tier.kind.environment() {
            Some(kind) => {
                let label = format!("{}-{}", variant_id, tier.kind.name());
                let request = match kind {
                    EnvironmentKind::Cluster => ProvisionRequest::cluster(label, &target.profile.server, tier.nodes),
                    EnvironmentKind::Simulator => {
                        ProvisionRequest::simulator(label, &target.profile.server, tier.nodes)
                    }
                };
                let acquire = EnvironmentLease::acquire(self.provisioner.clone(), &request, self.provision_timeout);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Step::Halted(
                            TierResult::not_run(&variant_id, tier.kind, "cancelled during provisioning"),
                            TierHalt::Cancelled,
                        );
                    }
                    acquired = acquire => match acquired {
                        Ok(lease) => Some(lease),
                        Err(error) => {
                            let result = TierResult::not_run(&variant_id, tier.kind, format!("provisioning failed: {}", error))
                                .with_kind(ErrorKind::ProvisioningError);
                            return Step::Halted(result, TierHalt::Provisioning { tier: tier.kind, error });
                        }
                    }
                }
            }
            None => None,
        };

        let env = lease.as_ref().map(|l| l.env());
        let body = self.tier_body(target, tier, env, upgrade_target.as_deref());
        let timeout = Duration::from_secs(tier.timeout_secs);
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => Step::Halted(
                TierResult::not_run(&variant_id, tier.kind, "cancelled while running"),
                TierHalt::Cancelled,
            ),
            outcome = tokio::time::timeout(timeout, body) => match outcome {
                Ok(result) => Step::Recorded(result),
                Err(_) => Step::Recorded(
                    TierResult::new(&variant_id, tier.kind, TierStatus::TimedOut)
                        .with_detail(format!("exceeded {}s", tier.timeout_secs))
                        .with_kind(ErrorKind::TestTierFailure),
                ),
            }
        };

        if let Some(lease) = lease {
            debug!(label = %lease.label(), "Releasing tier environment");
            lease.release().await;
        }

        match step {
            Step::Recorded(mut result) => {
                result.duration_ms = start.elapsed().as_millis() as u64;
                Step::Recorded(result)
            }
            halted => halted,
        }
    }

    async fn tier_body(
        &self,
        target: &VariantTarget<'_>,
        tier: &TierConfig,
        env: Option<Arc<dyn Environment>>,
        upgrade_target: Option<&str>,
    ) -> TierResult {
        let variant_id = target.variant.id();
        let report_path = target.report_dir.join(tier.kind.report_file_name());

        if let (Some(to), Some(env)) = (upgrade_target, env.as_ref()) {
            let report = self.harness.run(env.as_ref(), to).await;
            let mut result = if report.verified() {
                TierResult::new(&variant_id, tier.kind, TierStatus::Passed)
            } else {
                TierResult::new(&variant_id, tier.kind, TierStatus::Failed)
                    .with_kind(ErrorKind::UpgradeCompatibilityFailure)
                    .with_detail(report.detail.clone().unwrap_or_default())
            };
            if write_upgrade_report(&report_path, &report).is_ok() {
                result.report_path = Some(report_path);
            }
            result.upgrade = Some(report);
            return result;
        }

        let contact_points = env
            .as_ref()
            .map(|e| e.info().contact_points.join(","))
            .unwrap_or_default();
        let placeholders = Placeholders::new()
            .set("report", report_path.display().to_string())
            .set("out_dir", target.report_dir.display().to_string())
            .set("build", target.product.location.display().to_string())
            .set("artifact", target.artifact.location().display().to_string())
            .set("contact_points", contact_points)
            .set("server_version", target.profile.server.clone());
        let invocation = TierInvocation {
            tier,
            profile: target.profile,
            placeholders: &placeholders,
            work_dir: &self.workspace,
        };

        match self.executor.execute(&invocation).await {
            Ok(execution) => {
                write_log(target.report_dir, tier.kind, &execution);
                classify(&variant_id, tier.kind, &execution, &report_path)
            }
            Err(e) => TierResult::new(&variant_id, tier.kind, TierStatus::Error)
                .with_detail(e.to_string())
                .with_kind(ErrorKind::TestTierFailure),
        }
    }
}

impl std::fmt::Debug for TestOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestOrchestrator")
            .field("provision_timeout", &self.provision_timeout)
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

/// Passed on a clean exit; `error` when the report shows only errors;
/// `failed` otherwise.
fn classify(variant_id: &str, tier: TierKind, execution: &TierExecution, report_path: &Path) -> TierResult {
    let summary = JunitSummary::read(report_path);
    let status = if execution.passed() {
        TierStatus::Passed
    } else if summary.map_or(false, |s| s.only_errors()) {
        TierStatus::Error
    } else {
        TierStatus::Failed
    };

    let mut result = TierResult::new(variant_id, tier, status);
    result.summary = summary;
    if report_path.exists() {
        result.report_path = Some(report_path.to_path_buf());
    }
    if !status.is_passed() {
        result.failure_kind = Some(ErrorKind::TestTierFailure);
        result.detail = Some(format!("exit code {}", execution.exit_code));
    }
    result
}

fn write_log(report_dir: &Path, tier: TierKind, execution: &TierExecution) {
    let path = report_dir.join(format!("{}.log", tier.name()));
    let body = format!("{}\n--- stderr ---\n{}", execution.stdout, execution.stderr);
    if let Err(e) = std::fs::create_dir_all(report_dir).and_then(|_| std::fs::write(&path, body)) {
        warn!(path = %path.display(), error = %e, "Failed to write tier log");
    }
}

/// Single-case JUnit report for the upgrade tier.
fn write_upgrade_report(path: &Path, report: &UpgradeReport) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let failures = usize::from(!report.verified());
    let failure = match &report.detail {
        Some(detail) if !report.verified() => format!("<failure message=\"{}\"/>", xml_escape(detail)),
        _ => String::new(),
    };
    let xml = format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
         <testsuite name=\"rolling-upgrade\" tests=\"1\" failures=\"{}\" errors=\"0\" skipped=\"0\">\n\
         <testcase classname=\"upgrade\" name=\"{}-to-{}\">{}</testcase>\n\
         </testsuite>\n",
        failures,
        xml_escape(&report.from_version),
        xml_escape(&report.target_version),
        failure
    );
    std::fs::write(path, xml)
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution(exit_code: i32) -> TierExecution {
        TierExecution {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
            success: exit_code == 0,
        }
    }

    #[test]
    fn test_classify_clean_exit() {
        let result = classify("v", TierKind::Unit, &execution(0), Path::new("/nonexistent.xml"));
        assert_eq!(result.status, TierStatus::Passed);
        assert!(result.failure_kind.is_none());
        assert!(result.report_path.is_none());
    }

    #[test]
    fn test_classify_errors_only_report() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("unit_results.xml");
        std::fs::write(&report, r#"<testsuite tests="3" failures="0" errors="2"/>"#).unwrap();
        let result = classify("v", TierKind::Unit, &execution(1), &report);
        assert_eq!(result.status, TierStatus::Error);
        assert_eq!(result.report_path.as_deref(), Some(report.as_path()));

        std::fs::write(&report, r#"<testsuite tests="3" failures="1" errors="2"/>"#).unwrap();
        let result = classify("v", TierKind::Unit, &execution(1), &report);
        assert_eq!(result.status, TierStatus::Failed);
        assert_eq!(result.failure_kind, Some(ErrorKind::TestTierFailure));
    }

    #[test]
    fn test_upgrade_report_is_readable_junit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upgrade_results.xml");
        let report = UpgradeReport {
            from_version: "3.11".to_string(),
            target_version: "4.0".to_string(),
            final_state: crate::upgrade::UpgradeState::Failed,
            transitions: Vec::new(),
            phases: Default::default(),
            detail: Some("swap error rate 0.5 > 0.05".to_string()),
        };
        write_upgrade_report(&path, &report).unwrap();
        let summary = JunitSummary::read(&path).unwrap();
        assert_eq!(summary.tests, 1);
        assert_eq!(summary.failures, 1);
    }

    #[test]
    fn test_status_names() {
        assert_eq!(TierStatus::TimedOut.to_string(), "timed-out");
        assert_eq!(serde_json::to_string(&TierStatus::NotRun).unwrap(), "\"not-run\"");
    }
}
