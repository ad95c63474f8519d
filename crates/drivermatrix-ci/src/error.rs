//! Error taxonomy for the pipeline.
//!
//! Only [`ConfigurationError`] is fatal to a run. Build, packaging and
//! provisioning errors abort a single variant and are recorded with the
//! stage they happened in. Tier failures are never errors at all; they are
//! tagged outcomes inside a `TierResult`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid pipeline definition. Raised before any variant starts.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("failed to read configuration {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("axis `{0}` is declared more than once")]
    DuplicateAxis(String),

    #[error("axis `{0}` declares no values")]
    EmptyAxis(String),

    #[error("{context} references unknown axis `{axis}`")]
    UnknownAxis { context: String, axis: String },

    #[error("{context} references value `{value}` not declared on axis `{axis}`")]
    UnknownAxisValue {
        context: String,
        axis: String,
        value: String,
    },

    #[error("exclusion rule #{0} constrains no axis and would exclude every variant")]
    EmptyRule(usize),

    #[error("unknown schedule `{0}`")]
    UnknownSchedule(String),

    #[error("invalid acceleration mode `{0}` (expected on/off)")]
    InvalidAccelMode(String),

    #[error("tier `{0}` is declared more than once")]
    DuplicateTier(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("matrix resolves to zero variants after exclusions")]
    EmptyMatrix,
}

/// Native extension build failure. Fatal to the variant.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("{mode} build failed (exit code {exit_code}): {stderr}")]
    Compilation {
        mode: &'static str,
        exit_code: i32,
        stderr: String,
    },

    #[error("build command could not be started: {0}")]
    Spawn(String),

    #[error("build exceeded {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("variant requests accelerated={expected} but build produced accelerated={actual}")]
    ModeMismatch { expected: bool, actual: bool },

    #[error("acceleration verification failed: {0}")]
    Verification(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Artifact packaging or repair failure. Fatal to that artifact only.
#[derive(Error, Debug)]
pub enum PackagingError {
    #[error("ABI tag `{0}` is not available in the build environment")]
    AbiUnavailable(String),

    #[error("unresolved dependency `{library}`: not found in {searched} search path(s)")]
    UnresolvedDependency { library: String, searched: usize },

    #[error("artifact location {0} is already taken")]
    LocationCollision(String),

    #[error("`{0}` not found; install it or point packaging.patchelf at it")]
    ToolNotFound(String),

    #[error("`{command}` failed: {stderr}")]
    ToolFailed { command: String, stderr: String },

    #[error("{module} still loads `{library}` from outside the artifact after repair")]
    NotPortable { module: String, library: String },

    #[error("artifact for variant {0} was already published")]
    AlreadyPublished(String),

    #[error("artifact manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result aggregation misuse.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AggregationError {
    #[error("tier `{tier}` already has a result for variant {variant}")]
    DuplicateTierResult { variant: String, tier: String },

    #[error("variant {0} was reported twice")]
    DuplicateVariant(String),

    #[error("variant {0} has not reached a terminal state")]
    VariantPending(String),

    #[error("variant {0} was not scheduled in this run")]
    UnknownVariant(String),
}

/// Chain stage a fatal-to-variant error happened in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Build,
    Package,
    Repair,
    Provision,
    Test,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Build => "build",
            Stage::Package => "package",
            Stage::Repair => "repair",
            Stage::Provision => "provision",
            Stage::Test => "test",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Error kinds as they appear in reports. A timeout takes the kind of the
/// step that timed out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigurationError,
    ProvisioningError,
    BuildError,
    PackagingError,
    TestTierFailure,
    UpgradeCompatibilityFailure,
}

/// An error that aborted one variant's chain.
#[derive(Error, Debug)]
pub enum VariantError {
    #[error("build: {0}")]
    Build(#[from] BuildError),

    #[error("{stage}: {source}")]
    Packaging {
        stage: Stage,
        #[source]
        source: PackagingError,
    },

    #[error("provision: {0}")]
    Provisioning(#[from] drivermatrix_env::EnvError),
}

impl VariantError {
    pub fn stage(&self) -> Stage {
        match self {
            VariantError::Build(_) => Stage::Build,
            VariantError::Packaging { stage, .. } => *stage,
            VariantError::Provisioning(_) => Stage::Provision,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VariantError::Build(_) => ErrorKind::BuildError,
            VariantError::Packaging { .. } => ErrorKind::PackagingError,
            VariantError::Provisioning(_) => ErrorKind::ProvisioningError,
        }
    }
}
