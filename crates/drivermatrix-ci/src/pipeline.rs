//! Matrix pipeline orchestration.
//!
//! Each variant runs its own chain (build, package, repair, test) as an
//! independent task; at most `concurrency` chains are in flight. Outcomes are
//! handed to the aggregator only after every task has finished, so the
//! finalized run always covers every scheduled variant.

use crate::build::{AccelerationBuilder, BuildBackend, BuildProduct, CommandBuildBackend};
use crate::cache::ArtifactCache;
use crate::cancel::{cancel_pair, CancelToken};
use crate::config::{PipelineConfig, RunPlan};
use crate::elf::{ElfEditor, Patchelf};
use crate::error::{ErrorKind, PackagingError, Stage, VariantError};
use crate::matrix::BuildVariant;
use crate::orchestrator::{TestOrchestrator, TierHalt, TierResult, VariantTarget};
use crate::package::{AbiPlan, ArtifactPackager};
use crate::profile::VariantProfile;
use crate::repair::{ArtifactRepairer, RepairedArtifact};
use crate::report::{RunAggregator, RunReport, VariantTerminal};
use crate::runner::{CommandTierExecutor, TierExecutor};
use crate::tier::TierConfig;
use crate::upgrade::UpgradeHarness;
use drivermatrix_env::{ExternalProvisioner, Provisioner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Report file written into the output directory.
pub const REPORT_FILE: &str = "pipeline_report.json";

/// Terminal outcome of one variant's chain.
#[derive(Debug)]
pub struct VariantOutcome {
    pub variant_id: String,
    pub terminal: VariantTerminal,
    pub artifact: Option<RepairedArtifact>,
    pub tiers: Vec<TierResult>,
}

struct Inner {
    library: String,
    version: String,
    builder: AccelerationBuilder,
    packager: Arc<ArtifactPackager>,
    repairer: Arc<ArtifactRepairer>,
    orchestrator: TestOrchestrator,
    cache: ArtifactCache,
    reports_dir: PathBuf,
}

/// Runs resolved plans. Cheap to clone.
#[derive(Clone)]
pub struct MatrixPipeline {
    inner: Arc<Inner>,
    run_id: String,
    run_dir: PathBuf,
    output_dir: PathBuf,
}

impl MatrixPipeline {
    /// Pipeline with explicit collaborators.
    pub fn new(
        config: &PipelineConfig,
        output_dir: &Path,
        backend: Arc<dyn BuildBackend>,
        editor: Arc<dyn ElfEditor>,
        provisioner: Arc<dyn Provisioner>,
        executor: Arc<dyn TierExecutor>,
    ) -> Self {
        let run_id = Uuid::new_v4().to_string();
        let run_dir = output_dir.join(&run_id);
        let section = &config.pipeline;

        let builder = AccelerationBuilder::new(backend, run_dir.join("build"));
        let packager = Arc::new(ArtifactPackager::new(
            &section.library,
            &section.version,
            &section.platform_tag,
            config.packaging.clone(),
            run_dir.join("dist"),
        ));
        let repairer = Arc::new(ArtifactRepairer::new(
            config.packaging.baseline_libs.iter().cloned(),
            config.packaging.library_search_paths.clone(),
            editor,
        ));
        let orchestrator = TestOrchestrator::new(
            provisioner,
            executor,
            UpgradeHarness::new(config.upgrade.clone()),
            config.environment.provision_timeout(),
            section.workspace.clone(),
        );

        Self {
            inner: Arc::new(Inner {
                library: section.library.clone(),
                version: section.version.clone(),
                builder,
                packager,
                repairer,
                orchestrator,
                cache: ArtifactCache::new(),
                reports_dir: run_dir.join("reports"),
            }),
            run_id,
            run_dir,
            output_dir: output_dir.to_path_buf(),
        }
    }

    /// Pipeline running the configured commands against real environments.
    pub fn from_config(config: &PipelineConfig, output_dir: &Path) -> Self {
        let backend = CommandBuildBackend::new(config.build.clone(), config.pipeline.workspace.clone());
        let provisioner = ExternalProvisioner::new(
            config.environment.cluster.clone(),
            config.environment.simulator.clone(),
        );
        Self::new(
            config,
            output_dir,
            Arc::new(backend),
            Arc::new(Patchelf::new(config.packaging.patchelf.clone())),
            Arc::new(provisioner),
            Arc::new(CommandTierExecutor),
        )
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.inner.cache
    }

    /// Run every variant of `plan` and write the report. Only aggregation
    /// misuse or an unwritable output directory is an error here; variant
    /// failures end up in the report.
    pub async fn run(&self, plan: &RunPlan) -> anyhow::Result<RunReport> {
        let start = Instant::now();
        std::fs::create_dir_all(&self.run_dir)?;
        info!(
            run_id = %self.run_id,
            schedule = %plan.schedule,
            variants = plan.variants.len(),
            tiers = plan.tiers.len(),
            concurrency = plan.concurrency,
            "Starting matrix pipeline"
        );

        let (cancel, token) = cancel_pair();
        let semaphore = Arc::new(Semaphore::new(plan.concurrency.max(1)));
        let tiers = Arc::new(plan.tiers.clone());

        let handles: Vec<_> = plan
            .variants
            .iter()
            .cloned()
            .map(|(variant, profile)| {
                let inner = self.inner.clone();
                let semaphore = semaphore.clone();
                let tiers = tiers.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return cancelled(&variant, &tiers, "skipped: scheduler closed");
                    };
                    if token.is_cancelled() {
                        return cancelled(&variant, &tiers, "skipped: run cancelled");
                    }
                    inner.run_variant(&variant, &profile, &tiers, &token).await
                })
            })
            .collect();

        let joined = futures::future::join_all(handles);
        let joined = match plan.run_timeout {
            Some(limit) => {
                tokio::pin!(joined);
                tokio::select! {
                    results = &mut joined => results,
                    _ = tokio::time::sleep(limit) => {
                        warn!(timeout_secs = limit.as_secs(), "Run timeout reached; cancelling in-flight variants");
                        cancel.cancel();
                        joined.await
                    }
                }
            }
            None => joined.await,
        };

        let variants: Vec<BuildVariant> = plan.variants.iter().map(|(v, _)| v.clone()).collect();
        let mut aggregator = RunAggregator::new(
            &self.run_id,
            &plan.schedule,
            &self.inner.library,
            &self.inner.version,
            &variants,
        );
        for (joined, variant) in joined.into_iter().zip(&variants) {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(variant = %variant.id(), error = %e, "Variant task panicked");
                    VariantOutcome {
                        variant_id: variant.id(),
                        terminal: VariantTerminal::Aborted {
                            stage: Stage::Test,
                            kind: ErrorKind::TestTierFailure,
                            message: format!("variant task failed: {}", e),
                        },
                        artifact: None,
                        tiers: not_run(&variant.id(), &tiers, "skipped: variant task failed"),
                    }
                }
            };
            for result in outcome.tiers {
                aggregator.record_tier(result)?;
            }
            if let Some(artifact) = outcome.artifact {
                aggregator.record_artifact(&outcome.variant_id, artifact)?;
            }
            aggregator.complete(&outcome.variant_id, outcome.terminal)?;
        }

        let report = RunReport::new(aggregator.finalize()?);
        report.write_json(&self.run_dir.join(REPORT_FILE))?;
        report.write_json(&self.output_dir.join(REPORT_FILE))?;

        info!(
            run_id = %self.run_id,
            duration_ms = start.elapsed().as_millis() as u64,
            flagged = report.flagged,
            "Matrix pipeline finished"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for MatrixPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixPipeline")
            .field("run_id", &self.run_id)
            .field("run_dir", &self.run_dir)
            .finish_non_exhaustive()
    }
}

impl Inner {
    async fn run_variant(
        &self,
        variant: &BuildVariant,
        profile: &VariantProfile,
        tiers: &[TierConfig],
        cancel: &CancelToken,
    ) -> VariantOutcome {
        let variant_id = variant.id();

        let abi_tag = match self.packager.config().plan(&profile.runtime) {
            AbiPlan::Build(tag) => tag,
            AbiPlan::Excluded { reason, .. } => {
                info!(variant = %variant_id, reason = %reason, "Variant skipped");
                return VariantOutcome {
                    tiers: not_run(&variant_id, tiers, format!("skipped: {}", reason)),
                    variant_id,
                    terminal: VariantTerminal::Skipped { reason },
                    artifact: None,
                };
            }
        };

        let chain = async {
            let product = self.builder.build(variant, profile).await?;
            let artifact = self.publish(&product, variant, &abi_tag).await?;
            Ok::<_, VariantError>((product, artifact))
        };
        let built = tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(variant, tiers, "skipped: run cancelled"),
            built = chain => built,
        };
        let (product, artifact) = match built {
            Ok(built) => built,
            Err(e) => {
                warn!(variant = %variant_id, stage = %e.stage(), error = %e, "Variant aborted");
                return VariantOutcome {
                    tiers: not_run(&variant_id, tiers, format!("skipped: {} failed", e.stage())),
                    variant_id,
                    terminal: VariantTerminal::aborted(&e),
                    artifact: None,
                };
            }
        };

        let report_dir = self.reports_dir.join(&variant_id);
        let target = VariantTarget {
            variant,
            profile,
            product: &product,
            artifact: &artifact,
            report_dir: &report_dir,
        };
        let run = self.orchestrator.run_tiers(&target, tiers, cancel).await;

        let terminal = match run.halt {
            None => VariantTerminal::Completed,
            Some(TierHalt::Cancelled) => VariantTerminal::Cancelled,
            Some(TierHalt::Provisioning { error, .. }) => VariantTerminal::aborted(&VariantError::from(error)),
        };
        VariantOutcome {
            variant_id,
            terminal,
            artifact: Some(artifact.as_ref().clone()),
            tiers: run.results,
        }
    }

    /// Package and repair on the blocking pool, then publish.
    async fn publish(
        &self,
        product: &BuildProduct,
        variant: &BuildVariant,
        abi_tag: &str,
    ) -> Result<Arc<RepairedArtifact>, VariantError> {
        let packager = self.packager.clone();
        let repairer = self.repairer.clone();
        let product = product.clone();
        let variant = variant.clone();
        let abi_tag = abi_tag.to_string();
        let repaired = tokio::task::spawn_blocking(move || -> Result<RepairedArtifact, VariantError> {
            let descriptor = packager
                .package(&product, &variant, &abi_tag)
                .map_err(packaging(Stage::Package))?;
            repairer.repair(&descriptor).map_err(packaging(Stage::Repair))
        })
        .await
        .map_err(|e| packaging(Stage::Package)(PackagingError::Io(std::io::Error::other(e))))??;
        self.cache.publish(repaired).await.map_err(packaging(Stage::Package))
    }
}

fn packaging(stage: Stage) -> impl Fn(PackagingError) -> VariantError {
    move |source| VariantError::Packaging { stage, source }
}

fn not_run(variant_id: &str, tiers: &[TierConfig], detail: impl Into<String>) -> Vec<TierResult> {
    let detail = detail.into();
    tiers
        .iter()
        .map(|tier| TierResult::not_run(variant_id, tier.kind, detail.clone()))
        .collect()
}

fn cancelled(variant: &BuildVariant, tiers: &[TierConfig], detail: &str) -> VariantOutcome {
    let variant_id = variant.id();
    VariantOutcome {
        tiers: not_run(&variant_id, tiers, detail),
        variant_id,
        terminal: VariantTerminal::Cancelled,
        artifact: None,
    }
}
