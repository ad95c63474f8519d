//! Test tier definitions and configuration.

use drivermatrix_env::EnvironmentKind;
use serde::{Deserialize, Serialize};

/// Test tiers, in the fixed order they run for each variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum TierKind {
    /// Unit tests against the unpackaged build product
    Unit,

    /// Tests against the protocol simulator
    Simulation,

    /// Standard integration suite against a real cluster
    StandardIntegration,

    /// Long-running integration suite against a real cluster
    LongIntegration,

    /// Rolling-upgrade verification on a live cluster
    Upgrade,
}

impl TierKind {
    /// All tiers in execution order.
    pub const ALL: [TierKind; 5] = [
        TierKind::Unit,
        TierKind::Simulation,
        TierKind::StandardIntegration,
        TierKind::LongIntegration,
        TierKind::Upgrade,
    ];

    /// Short name used in report files and logs.
    pub fn name(&self) -> &'static str {
        match self {
            TierKind::Unit => "unit",
            TierKind::Simulation => "simulation",
            TierKind::StandardIntegration => "standard",
            TierKind::LongIntegration => "long",
            TierKind::Upgrade => "upgrade",
        }
    }

    /// `<tier>_results.xml`
    pub fn report_file_name(&self) -> String {
        format!("{}_results.xml", self.name())
    }

    /// Environment the tier runs against, if any.
    pub fn environment(&self) -> Option<EnvironmentKind> {
        match self {
            TierKind::Unit => None,
            TierKind::Simulation => Some(EnvironmentKind::Simulator),
            TierKind::StandardIntegration | TierKind::LongIntegration | TierKind::Upgrade => {
                Some(EnvironmentKind::Cluster)
            }
        }
    }

    /// Default test command. `{report}` is replaced with the report path.
    pub fn command(&self) -> Vec<String> {
        let suite = match self {
            TierKind::Unit => "tests/unit/",
            TierKind::Simulation => "tests/integration/simulacron/",
            TierKind::StandardIntegration => "tests/integration/standard/",
            TierKind::LongIntegration => "tests/integration/long/",
            // Driven by the upgrade harness, not a test process.
            TierKind::Upgrade => return Vec::new(),
        };
        vec![
            "pytest".to_string(),
            "-v".to_string(),
            suite.to_string(),
            "--junit-xml={report}".to_string(),
        ]
    }

    pub fn default_timeout_secs(&self) -> u64 {
        match self {
            TierKind::Unit => 600,
            TierKind::Simulation => 1200,
            TierKind::StandardIntegration => 3600,
            TierKind::LongIntegration => 7200,
            TierKind::Upgrade => 3600,
        }
    }

    pub fn default_mode(&self) -> ExecutionMode {
        match self {
            TierKind::Unit | TierKind::Simulation => ExecutionMode::SupportsIsolation,
            _ => ExecutionMode::Sequential,
        }
    }

    pub fn parse(name: &str) -> Option<TierKind> {
        TierKind::ALL
            .into_iter()
            .find(|kind| kind.name() == name || kind.kebab() == name)
    }

    fn kebab(&self) -> &'static str {
        match self {
            TierKind::StandardIntegration => "standard-integration",
            TierKind::LongIntegration => "long-integration",
            other => other.name(),
        }
    }
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How a tier's test process may be scheduled.
///
/// The mode reaches the test process as `DRIVERMATRIX_EXECUTION_MODE`, and
/// a tier that supports isolation gets its `isolation_args` appended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    Sequential,
    SupportsIsolation,
}

/// Environment variable carrying the tier's execution mode.
pub const EXECUTION_MODE_ENV: &str = "DRIVERMATRIX_EXECUTION_MODE";

impl ExecutionMode {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::SupportsIsolation => "supports-isolation",
        }
    }
}

/// Configuration for one test tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierConfig {
    pub kind: TierKind,

    /// Command to execute (first element is executable).
    #[serde(default)]
    pub command: Vec<String>,

    /// Timeout in seconds.
    pub timeout_secs: u64,

    #[serde(default = "default_mode")]
    pub mode: ExecutionMode,

    /// Appended to the command when `mode` is `supports-isolation`, e.g.
    /// `["--forked"]` to run each test in its own process.
    #[serde(default)]
    pub isolation_args: Vec<String>,

    /// Nodes to provision for cluster and simulator tiers.
    #[serde(default = "default_nodes")]
    pub nodes: usize,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_mode() -> ExecutionMode {
    ExecutionMode::Sequential
}

fn default_nodes() -> usize {
    3
}

fn default_enabled() -> bool {
    true
}

impl TierConfig {
    /// Tier configuration with the tier's defaults.
    pub fn from_kind(kind: TierKind) -> Self {
        Self {
            kind,
            command: kind.command(),
            timeout_secs: kind.default_timeout_secs(),
            mode: kind.default_mode(),
            isolation_args: Vec::new(),
            nodes: default_nodes(),
            enabled: true,
        }
    }

    /// Tier configuration with a custom command.
    pub fn custom(kind: TierKind, command: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            command,
            timeout_secs,
            ..Self::from_kind(kind)
        }
    }

    pub fn with_nodes(mut self, nodes: usize) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode, isolation_args: Vec<String>) -> Self {
        self.mode = mode;
        self.isolation_args = isolation_args;
        self
    }

    /// Disable this tier.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Command plus the isolation arguments the mode calls for.
    pub fn command_line(&self) -> Vec<String> {
        let mut line = self.command.clone();
        if self.mode == ExecutionMode::SupportsIsolation {
            line.extend(self.isolation_args.iter().cloned());
        }
        line
    }
}
