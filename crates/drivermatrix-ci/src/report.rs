//! Result aggregation, gate evaluation and report output.
//!
//! Provides the run's output artifacts:
//! - `PipelineRun`: the immutable record of every variant and tier outcome
//! - `RunReport`: machine-readable summary plus gate verdict (pipeline_report.json)
//! - a plain-text per-variant/per-tier table for terminals and logs

use crate::error::{AggregationError, ErrorKind, Stage, VariantError};
use crate::matrix::BuildVariant;
use crate::orchestrator::{TierResult, TierStatus};
use crate::package::{ArtifactDescriptor, VendoredDependency};
use crate::repair::RepairedArtifact;
use crate::tier::TierKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

// ── variant terminal states ───────────────────────────────────────────────

/// How a variant's chain ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum VariantTerminal {
    /// Every tier ran (or was deliberately not run) and was recorded.
    Completed,
    /// A fatal-to-variant error stopped the chain.
    Aborted {
        stage: Stage,
        kind: ErrorKind,
        message: String,
    },
    /// Dropped by packaging policy before any build work.
    Skipped { reason: String },
    /// Stopped by run cancellation.
    Cancelled,
}

impl VariantTerminal {
    pub fn aborted(error: &VariantError) -> Self {
        VariantTerminal::Aborted {
            stage: error.stage(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            VariantTerminal::Completed => "completed",
            VariantTerminal::Aborted { .. } => "aborted",
            VariantTerminal::Skipped { .. } => "skipped",
            VariantTerminal::Cancelled => "cancelled",
        }
    }
}

/// Everything recorded about one variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantRecord {
    pub variant_id: String,
    pub signature: String,
    pub terminal: VariantTerminal,
    pub artifact: Option<ArtifactDescriptor>,
    pub vendored: Vec<VendoredDependency>,
    pub tiers: Vec<TierResult>,
}

impl VariantRecord {
    pub fn tier(&self, kind: TierKind) -> Option<&TierResult> {
        self.tiers.iter().find(|t| t.tier == kind)
    }
}

// ── aggregation ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct Slot {
    signature: String,
    terminal: Option<VariantTerminal>,
    artifact: Option<RepairedArtifact>,
    tiers: BTreeMap<TierKind, TierResult>,
}

/// Collects variant outcomes; finalizes only once every scheduled variant
/// has reached a terminal state.
#[derive(Debug)]
pub struct RunAggregator {
    run_id: String,
    schedule: String,
    library: String,
    version: String,
    started_at: DateTime<Utc>,
    order: Vec<String>,
    slots: HashMap<String, Slot>,
}

impl RunAggregator {
    pub fn new(
        run_id: impl Into<String>,
        schedule: impl Into<String>,
        library: impl Into<String>,
        version: impl Into<String>,
        variants: &[BuildVariant],
    ) -> Self {
        let mut order = Vec::with_capacity(variants.len());
        let mut slots = HashMap::with_capacity(variants.len());
        for variant in variants {
            let id = variant.id();
            order.push(id.clone());
            slots.insert(
                id,
                Slot {
                    signature: variant.signature(),
                    terminal: None,
                    artifact: None,
                    tiers: BTreeMap::new(),
                },
            );
        }
        Self {
            run_id: run_id.into(),
            schedule: schedule.into(),
            library: library.into(),
            version: version.into(),
            started_at: Utc::now(),
            order,
            slots,
        }
    }

    fn slot(&mut self, variant_id: &str) -> Result<&mut Slot, AggregationError> {
        self.slots
            .get_mut(variant_id)
            .ok_or_else(|| AggregationError::UnknownVariant(variant_id.to_string()))
    }

    /// Append a tier result. A (variant, tier) pair is recorded once.
    pub fn record_tier(&mut self, result: TierResult) -> Result<(), AggregationError> {
        let slot = self.slot(&result.variant_id)?;
        if slot.tiers.contains_key(&result.tier) {
            return Err(AggregationError::DuplicateTierResult {
                variant: result.variant_id.clone(),
                tier: result.tier.name().to_string(),
            });
        }
        slot.tiers.insert(result.tier, result);
        Ok(())
    }

    pub fn record_artifact(&mut self, variant_id: &str, artifact: RepairedArtifact) -> Result<(), AggregationError> {
        self.slot(variant_id)?.artifact = Some(artifact);
        Ok(())
    }

    pub fn complete(&mut self, variant_id: &str, terminal: VariantTerminal) -> Result<(), AggregationError> {
        let slot = self.slot(variant_id)?;
        if slot.terminal.is_some() {
            return Err(AggregationError::DuplicateVariant(variant_id.to_string()));
        }
        slot.terminal = Some(terminal);
        Ok(())
    }

    /// Freeze the run. Fails if any variant has no terminal state yet.
    pub fn finalize(mut self) -> Result<PipelineRun, AggregationError> {
        if let Some(pending) = self
            .order
            .iter()
            .find(|id| self.slots.get(*id).map_or(true, |s| s.terminal.is_none()))
        {
            return Err(AggregationError::VariantPending(pending.clone()));
        }

        let finished_at = Utc::now();
        let mut variants = Vec::with_capacity(self.order.len());
        for id in &self.order {
            let Some(slot) = self.slots.remove(id) else {
                continue;
            };
            let (artifact, vendored) = match slot.artifact {
                Some(repaired) => (Some(repaired.descriptor), repaired.vendored),
                None => (None, Vec::new()),
            };
            variants.push(VariantRecord {
                variant_id: id.clone(),
                signature: slot.signature,
                terminal: slot.terminal.unwrap_or(VariantTerminal::Cancelled),
                artifact,
                vendored,
                tiers: slot.tiers.into_values().collect(),
            });
        }

        Ok(PipelineRun {
            run_id: self.run_id,
            schedule: self.schedule,
            library: self.library,
            version: self.version,
            started_at: self.started_at,
            finished_at,
            variants,
        })
    }
}

/// Immutable record of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineRun {
    run_id: String,
    schedule: String,
    library: String,
    version: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    variants: Vec<VariantRecord>,
}

impl PipelineRun {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn schedule(&self) -> &str {
        &self.schedule
    }

    pub fn variants(&self) -> &[VariantRecord] {
        &self.variants
    }

    pub fn variant(&self, variant_id: &str) -> Option<&VariantRecord> {
        self.variants.iter().find(|v| v.variant_id == variant_id)
    }

    pub fn tier_results(&self) -> impl Iterator<Item = &TierResult> {
        self.variants.iter().flat_map(|v| v.tiers.iter())
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

// ── gate ──────────────────────────────────────────────────────────────────

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// One line per non-passing variant or tier (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// Turns a finished run into a verdict.
pub struct RunGate;

impl RunGate {
    /// Gate rule:
    /// - every aborted or cancelled variant is a violation
    /// - every failed, errored or timed-out tier is a violation
    /// - skipped variants and not-run tiers of completed variants are not
    pub fn evaluate(run: &PipelineRun) -> GateVerdict {
        let mut violations = Vec::new();

        for variant in run.variants() {
            match &variant.terminal {
                VariantTerminal::Aborted { stage, message, .. } => {
                    violations.push(format!(
                        "Variant {} ({}) aborted at {}: {}",
                        variant.variant_id, variant.signature, stage, message
                    ));
                }
                VariantTerminal::Cancelled => {
                    violations.push(format!(
                        "Variant {} ({}) was cancelled",
                        variant.variant_id, variant.signature
                    ));
                }
                VariantTerminal::Completed | VariantTerminal::Skipped { .. } => {}
            }

            for tier in &variant.tiers {
                if matches!(
                    tier.status,
                    TierStatus::Failed | TierStatus::Error | TierStatus::TimedOut
                ) {
                    violations.push(format!(
                        "Tier '{}' of variant {} {}{}",
                        tier.tier,
                        variant.variant_id,
                        tier.status,
                        tier.detail
                            .as_deref()
                            .map(|d| format!(": {}", d))
                            .unwrap_or_default()
                    ));
                }
            }
        }

        let passed = violations.is_empty();
        let message = if passed {
            "All variants passed".to_string()
        } else {
            format!("Run flagged with {} violation(s)", violations.len())
        };

        GateVerdict {
            passed,
            violations,
            message,
        }
    }
}

// ── pipeline_report.json ──────────────────────────────────────────────────

/// Tier outcome counts across the run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusTotals {
    pub variants: usize,
    pub completed: usize,
    pub aborted: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub passed: usize,
    pub failed: usize,
    pub error: usize,
    pub timed_out: usize,
    pub not_run: usize,
}

impl StatusTotals {
    pub fn from_run(run: &PipelineRun) -> Self {
        let mut totals = StatusTotals {
            variants: run.variants().len(),
            ..Default::default()
        };
        for variant in run.variants() {
            match variant.terminal {
                VariantTerminal::Completed => totals.completed += 1,
                VariantTerminal::Aborted { .. } => totals.aborted += 1,
                VariantTerminal::Skipped { .. } => totals.skipped += 1,
                VariantTerminal::Cancelled => totals.cancelled += 1,
            }
        }
        for tier in run.tier_results() {
            match tier.status {
                TierStatus::Passed => totals.passed += 1,
                TierStatus::Failed => totals.failed += 1,
                TierStatus::Error => totals.error += 1,
                TierStatus::TimedOut => totals.timed_out += 1,
                TierStatus::NotRun => totals.not_run += 1,
            }
        }
        totals
    }
}

/// Structured report for one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub run: PipelineRun,
    pub totals: StatusTotals,
    pub verdict: GateVerdict,
    /// Set when the run contains any failure, for the consuming reviewer.
    pub flagged: bool,
}

impl RunReport {
    pub fn new(run: PipelineRun) -> Self {
        let totals = StatusTotals::from_run(&run);
        let verdict = RunGate::evaluate(&run);
        Self {
            flagged: !verdict.passed,
            run,
            totals,
            verdict,
        }
    }

    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    pub fn read_json(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(std::io::Error::other)
    }

    /// Plain-text table: one row per variant, one column per tier.
    pub fn render_table(&self) -> String {
        let mut kinds: Vec<TierKind> = self.run.tier_results().map(|t| t.tier).collect();
        kinds.sort();
        kinds.dedup();

        let mut out = String::new();
        out.push_str(&format!("{:<12}  {:<10}", "variant", "state"));
        for kind in &kinds {
            out.push_str(&format!("  {:<10}", kind.name()));
        }
        out.push_str("  signature\n");

        for variant in self.run.variants() {
            out.push_str(&format!("{:<12}  {:<10}", variant.variant_id, variant.terminal.name()));
            for kind in &kinds {
                let cell = variant.tier(*kind).map(|t| t.status.name()).unwrap_or("-");
                out.push_str(&format!("  {:<10}", cell));
            }
            out.push_str(&format!("  {}\n", variant.signature));
        }

        let t = &self.totals;
        out.push_str(&format!(
            "\n{} variant(s): {} completed, {} aborted, {} skipped, {} cancelled\n",
            t.variants, t.completed, t.aborted, t.skipped, t.cancelled
        ));
        out.push_str(&format!(
            "tiers: {} passed, {} failed, {} error, {} timed-out, {} not-run\n",
            t.passed, t.failed, t.error, t.timed_out, t.not_run
        ));
        out.push_str(&format!("{}\n", self.verdict.message));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{resolve, Axis};

    fn variants() -> Vec<BuildVariant> {
        resolve(&[Axis::new("runtime", ["3.9", "3.12"])], &[]).unwrap()
    }

    fn result(variant: &BuildVariant, tier: TierKind, status: TierStatus) -> TierResult {
        let mut result = TierResult::not_run(&variant.id(), tier, "");
        result.status = status;
        result.detail = None;
        result
    }

    #[test]
    fn test_duplicate_tier_result_rejected() {
        let vs = variants();
        let mut agg = RunAggregator::new("run", "full", "driver", "1.0", &vs);
        agg.record_tier(result(&vs[0], TierKind::Unit, TierStatus::Passed)).unwrap();
        let err = agg
            .record_tier(result(&vs[0], TierKind::Unit, TierStatus::Failed))
            .unwrap_err();
        assert!(matches!(err, AggregationError::DuplicateTierResult { .. }));
    }

    #[test]
    fn test_finalize_waits_for_every_variant() {
        let vs = variants();
        let mut agg = RunAggregator::new("run", "full", "driver", "1.0", &vs);
        agg.complete(&vs[0].id(), VariantTerminal::Completed).unwrap();
        assert_eq!(
            agg.finalize().unwrap_err(),
            AggregationError::VariantPending(vs[1].id())
        );
    }

    #[test]
    fn test_unknown_variant_and_double_completion() {
        let vs = variants();
        let mut agg = RunAggregator::new("run", "full", "driver", "1.0", &vs);
        assert!(matches!(
            agg.complete("nope", VariantTerminal::Completed),
            Err(AggregationError::UnknownVariant(_))
        ));
        agg.complete(&vs[0].id(), VariantTerminal::Completed).unwrap();
        assert!(matches!(
            agg.complete(&vs[0].id(), VariantTerminal::Cancelled),
            Err(AggregationError::DuplicateVariant(_))
        ));
    }

    #[test]
    fn test_gate_flags_failures_but_not_skips() {
        let vs = variants();
        let mut agg = RunAggregator::new("run", "full", "driver", "1.0", &vs);
        agg.record_tier(result(&vs[0], TierKind::Unit, TierStatus::Passed)).unwrap();
        agg.record_tier(result(&vs[0], TierKind::Upgrade, TierStatus::NotRun)).unwrap();
        agg.complete(&vs[0].id(), VariantTerminal::Completed).unwrap();
        agg.complete(
            &vs[1].id(),
            VariantTerminal::Skipped {
                reason: "ABI tag cp312 is excluded by policy".to_string(),
            },
        )
        .unwrap();

        let report = RunReport::new(agg.finalize().unwrap());
        assert!(report.verdict.passed);
        assert!(!report.flagged);
        assert_eq!(report.totals.skipped, 1);
    }

    #[test]
    fn test_gate_one_violation_per_failing_tier() {
        let vs = variants();
        let mut agg = RunAggregator::new("run", "full", "driver", "1.0", &vs);
        agg.record_tier(result(&vs[0], TierKind::Unit, TierStatus::Failed)).unwrap();
        agg.record_tier(result(&vs[0], TierKind::Simulation, TierStatus::TimedOut)).unwrap();
        agg.complete(&vs[0].id(), VariantTerminal::Completed).unwrap();
        agg.complete(
            &vs[1].id(),
            VariantTerminal::Aborted {
                stage: Stage::Build,
                kind: ErrorKind::BuildError,
                message: "compile failed".to_string(),
            },
        )
        .unwrap();

        let report = RunReport::new(agg.finalize().unwrap());
        assert!(report.flagged);
        assert_eq!(report.verdict.violations.len(), 3);
        assert!(report.verdict.violations.iter().any(|v| v.contains("aborted at build")));
    }

    #[test]
    fn test_report_json_and_table() {
        let vs = variants();
        let mut agg = RunAggregator::new("run-1", "nightly", "driver", "1.0", &vs);
        for v in &vs {
            agg.record_tier(result(v, TierKind::Unit, TierStatus::Passed)).unwrap();
            agg.complete(&v.id(), VariantTerminal::Completed).unwrap();
        }
        let report = RunReport::new(agg.finalize().unwrap());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline_report.json");
        report.write_json(&path).unwrap();
        let loaded = RunReport::read_json(&path).unwrap();
        assert_eq!(loaded.run.run_id(), "run-1");
        assert_eq!(loaded.totals.passed, 2);

        let table = report.render_table();
        assert!(table.contains("runtime=3.9"));
        assert!(table.contains("unit"));
        assert!(table.contains("All variants passed"));
    }
}
