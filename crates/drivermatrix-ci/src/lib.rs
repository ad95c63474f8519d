//! drivermatrix-ci: Build-Matrix Release and Verification Pipeline
//!
//! For every valid combination of runtime, server version, concurrency
//! backend and acceleration mode, this crate:
//! - Resolves the matrix from axes and exclusion rules
//! - Builds the native extension (or the pure fallback) and checks which one it got
//! - Packages an ABI/platform tagged artifact and vendors non-baseline libraries
//! - Runs the test tiers in order, each against its own environment
//! - Aggregates every outcome into one immutable run and a gate verdict

pub mod build;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod elf;
pub mod error;
pub mod fakes;
pub mod files;
pub mod junit;
pub mod matrix;
pub mod orchestrator;
pub mod package;
pub mod pipeline;
pub mod profile;
pub mod repair;
pub mod report;
pub mod runner;
pub mod telemetry;
pub mod tier;
pub mod upgrade;

// Re-export key types
pub use build::{AccelerationBuilder, BuildBackend, BuildConfig, BuildProduct, CommandBuildBackend};
pub use cache::ArtifactCache;
pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use config::{PipelineConfig, RunPlan, Schedule, FULL_SCHEDULE};
pub use elf::{ElfEditor, Patchelf};
pub use error::{
    AggregationError, BuildError, ConfigurationError, ErrorKind, PackagingError, Stage, VariantError,
};
pub use junit::JunitSummary;
pub use matrix::{resolve, Axis, BuildVariant, ExclusionRule, Matrix};
pub use orchestrator::{TestOrchestrator, TierResult, TierStatus};
pub use package::{ArtifactDescriptor, ArtifactPackager, PackagingConfig};
pub use pipeline::{MatrixPipeline, REPORT_FILE};
pub use profile::{AccelMode, AxisRoles, VariantProfile};
pub use repair::{ArtifactRepairer, RepairedArtifact};
pub use report::{GateVerdict, PipelineRun, RunAggregator, RunGate, RunReport, VariantTerminal};
pub use runner::{CommandTierExecutor, TierExecutor};
pub use telemetry::init_tracing;
pub use tier::{TierConfig, TierKind};
pub use upgrade::{UpgradeConfig, UpgradeHarness, UpgradeReport, UpgradeState};
