//! Pipeline configuration (TOML).
//!
//! One file declares the matrix, the build and packaging policy, the test
//! tiers and the named schedules. Everything is validated before any
//! variant starts, so configuration mistakes never surface mid-run.

use crate::build::BuildConfig;
use crate::error::ConfigurationError;
use crate::matrix::{self, Axis, BuildVariant, ExclusionRule};
use crate::package::PackagingConfig;
use crate::profile::{AxisRoles, ProfileSwitches, VariantProfile};
use crate::tier::{TierConfig, TierKind};
use crate::upgrade::UpgradeConfig;
use drivermatrix_env::{ClusterManagerConfig, SimulatorConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the implicit schedule that runs the whole matrix.
pub const FULL_SCHEDULE: &str = "full";

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,

    #[serde(default, rename = "axis")]
    pub axes: Vec<Axis>,

    #[serde(default)]
    pub roles: AxisRoles,

    #[serde(default, rename = "exclude")]
    pub exclusions: Vec<ExclusionRule>,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub packaging: PackagingConfig,

    #[serde(default)]
    pub environment: EnvironmentConfig,

    #[serde(default, rename = "tier")]
    pub tiers: Vec<TierConfig>,

    #[serde(default)]
    pub upgrade: UpgradeConfig,

    #[serde(default, rename = "schedule")]
    pub schedules: BTreeMap<String, Schedule>,
}

/// `[pipeline]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Distribution name of the client library.
    pub library: String,
    pub version: String,
    #[serde(default = "default_platform_tag")]
    pub platform_tag: String,
    /// Maximum variants whose chains run at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Global bound; in-flight variants are cancelled when it expires.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Source checkout the build and test commands run in.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
}

fn default_platform_tag() -> String {
    "manylinux2014_x86_64".to_string()
}

fn default_concurrency() -> usize {
    4
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("matrix-out")
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

/// `[environment]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub cluster: ClusterManagerConfig,
    pub simulator: SimulatorConfig,
    pub provision_timeout_secs: u64,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterManagerConfig::default(),
            simulator: SimulatorConfig::default(),
            provision_timeout_secs: 900,
        }
    }
}

impl EnvironmentConfig {
    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }
}

/// `[schedule.<name>]`: overrides for a recurring run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Schedule {
    /// Axis value subsets; unnamed axes keep every value.
    pub axes: BTreeMap<String, Vec<String>>,
    /// Tier names to run; empty means every enabled tier.
    pub tiers: Vec<String>,
    /// Extra exclusions on top of the global ones.
    pub exclude: Vec<ExclusionRule>,
    pub verify_acceleration: bool,
    pub upgrade_only: bool,
    pub concurrency: Option<usize>,
}

/// A validated, resolved run: what every variant will do.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub schedule: String,
    pub variants: Vec<(BuildVariant, VariantProfile)>,
    pub tiers: Vec<TierConfig>,
    pub concurrency: usize,
    pub run_timeout: Option<Duration>,
}

impl PipelineConfig {
    /// Load and validate a configuration file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigurationError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigurationError> {
        let config: PipelineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every cross-reference in the file.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.pipeline.library.trim().is_empty() {
            return Err(ConfigurationError::Invalid("pipeline.library is empty".to_string()));
        }
        if self.pipeline.concurrency == 0 {
            return Err(ConfigurationError::Invalid(
                "pipeline.concurrency must be at least 1".to_string(),
            ));
        }
        matrix::validate_axes(&self.axes)?;
        matrix::validate_rules(&self.axes, &self.exclusions)?;

        let mut seen = BTreeSet::new();
        for tier in &self.tiers {
            if !seen.insert(tier.kind) {
                return Err(ConfigurationError::DuplicateTier(tier.kind.name().to_string()));
            }
        }

        self.upgrade.validate()?;

        for (name, schedule) in &self.schedules {
            let context = format!("schedule `{}`", name);
            let axes = matrix::restrict_axes(&self.axes, &schedule.axes, &context)?;
            matrix::validate_rules(&axes, &schedule.exclude)?;
            for tier in &schedule.tiers {
                if TierKind::parse(tier).is_none() {
                    return Err(ConfigurationError::Invalid(format!(
                        "{} names unknown tier `{}`",
                        context, tier
                    )));
                }
            }
            if schedule.concurrency == Some(0) {
                return Err(ConfigurationError::Invalid(format!(
                    "{} concurrency must be at least 1",
                    context
                )));
            }
        }
        Ok(())
    }

    /// Declared tiers in execution order, with tier defaults filled in.
    /// An empty `[[tier]]` list means every tier with its defaults.
    pub fn tiers_in_order(&self) -> Vec<TierConfig> {
        let mut tiers: Vec<TierConfig> = if self.tiers.is_empty() {
            TierKind::ALL.into_iter().map(TierConfig::from_kind).collect()
        } else {
            self.tiers.clone()
        };
        for tier in &mut tiers {
            if tier.command.is_empty() {
                tier.command = tier.kind.command();
            }
        }
        tiers.sort_by_key(|tier| tier.kind);
        tiers
    }

    /// Names of the schedules a run can select.
    pub fn schedule_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schedules.keys().cloned().collect();
        if !self.schedules.contains_key(FULL_SCHEDULE) {
            names.push(FULL_SCHEDULE.to_string());
        }
        names
    }

    /// Resolve the matrix and tier set for `schedule`.
    pub fn plan(&self, schedule: &str) -> Result<RunPlan, ConfigurationError> {
        let overrides = match self.schedules.get(schedule) {
            Some(found) => found.clone(),
            None if schedule == FULL_SCHEDULE => Schedule::default(),
            None => return Err(ConfigurationError::UnknownSchedule(schedule.to_string())),
        };

        let context = format!("schedule `{}`", schedule);
        let axes = matrix::restrict_axes(&self.axes, &overrides.axes, &context)?;
        let mut rules = self.exclusions.clone();
        rules.extend(overrides.exclude.iter().cloned());
        let variants = matrix::resolve(&axes, &rules)?;

        let switches = ProfileSwitches {
            verify_acceleration: overrides.verify_acceleration,
            upgrade_only: overrides.upgrade_only,
            simulator_binary: Some(self.environment.simulator.binary.clone()),
        };
        let variants = variants
            .into_iter()
            .map(|variant| {
                let profile = VariantProfile::from_variant(&variant, &self.roles, &switches)?;
                Ok((variant, profile))
            })
            .collect::<Result<Vec<_>, ConfigurationError>>()?;

        let selected: Option<BTreeSet<TierKind>> = if overrides.upgrade_only {
            Some([TierKind::Upgrade].into_iter().collect())
        } else if overrides.tiers.is_empty() {
            None
        } else {
            Some(overrides.tiers.iter().filter_map(|t| TierKind::parse(t)).collect())
        };
        let tiers: Vec<TierConfig> = self
            .tiers_in_order()
            .into_iter()
            .filter(|tier| tier.enabled)
            .filter(|tier| selected.as_ref().map_or(true, |s| s.contains(&tier.kind)))
            .collect();

        Ok(RunPlan {
            schedule: schedule.to_string(),
            variants,
            tiers,
            concurrency: overrides.concurrency.unwrap_or(self.pipeline.concurrency),
            run_timeout: self.pipeline.run_timeout_secs.map(Duration::from_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [pipeline]
        library = "scylla-driver"
        version = "3.29.0"

        [[axis]]
        name = "runtime"
        values = ["3.9", "3.12"]

        [[axis]]
        name = "server"
        values = ["3.11", "4.0"]

        [[axis]]
        name = "backend"
        values = ["libev", "asyncio"]

        [[axis]]
        name = "accel"
        values = ["on", "off"]

        [[exclude]]
        runtime = "3.12"
        accel = "on"

        [[tier]]
        kind = "unit"
        timeout_secs = 60

        [[tier]]
        kind = "standard-integration"
        timeout_secs = 600

        [[tier]]
        kind = "upgrade"
        timeout_secs = 900

        [schedule.commit]
        axes = { server = ["4.0"], backend = ["libev"] }
        tiers = ["unit"]

        [schedule.weekly-upgrade]
        upgrade_only = true
    "#;

    #[test]
    fn test_parse_sample() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.axes.len(), 4);
        assert_eq!(config.exclusions.len(), 1);
        assert_eq!(config.pipeline.platform_tag, "manylinux2014_x86_64");
        assert_eq!(config.pipeline.concurrency, 4);
    }

    #[test]
    fn test_full_plan() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        let plan = config.plan(FULL_SCHEDULE).unwrap();
        // 16 candidates minus (3.12, *, *, on) = 12
        assert_eq!(plan.variants.len(), 12);
        assert_eq!(plan.tiers.len(), 3);
        assert_eq!(plan.tiers[0].kind, TierKind::Unit);
        assert!(!plan.tiers[0].command.is_empty());
    }

    #[test]
    fn test_restricted_schedule() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        let plan = config.plan("commit").unwrap();
        assert_eq!(plan.variants.len(), 3);
        assert!(plan.variants.iter().all(|(v, _)| v.get("server") == Some("4.0")));
        assert_eq!(plan.tiers.len(), 1);
    }

    #[test]
    fn test_upgrade_only_schedule() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        let plan = config.plan("weekly-upgrade").unwrap();
        assert_eq!(plan.tiers.len(), 1);
        assert_eq!(plan.tiers[0].kind, TierKind::Upgrade);
        assert!(plan.variants.iter().all(|(_, p)| p.upgrade_only));
    }

    #[test]
    fn test_unknown_schedule() {
        let config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        assert!(matches!(
            config.plan("hourly").unwrap_err(),
            ConfigurationError::UnknownSchedule(_)
        ));
    }

    #[test]
    fn test_rule_with_unknown_axis_rejected_at_load() {
        let text = SAMPLE.replace("[[exclude]]\n        runtime", "[[exclude]]\n        python");
        let err = PipelineConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownAxis { .. }));
    }

    #[test]
    fn test_schedule_with_unknown_value_rejected_at_load() {
        let text = SAMPLE.replace("server = [\"4.0\"]", "server = [\"5.0\"]");
        let err = PipelineConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownAxisValue { .. }));
    }

    #[test]
    fn test_duplicate_tier_rejected() {
        let text = format!("{}\n[[tier]]\nkind = \"unit\"\ntimeout_secs = 5\n", SAMPLE);
        let err = PipelineConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateTier(_)));
    }

    #[test]
    fn test_default_tiers_when_none_declared() {
        let text = r#"
            [pipeline]
            library = "driver"
            version = "1.0"

            [[axis]]
            name = "runtime"
            values = ["3.11"]
        "#;
        let config = PipelineConfig::from_toml_str(text).unwrap();
        let tiers = config.tiers_in_order();
        assert_eq!(tiers.len(), 5);
        assert_eq!(tiers.last().map(|t| t.kind), Some(TierKind::Upgrade));
    }

    #[test]
    fn test_missing_file() {
        let err = PipelineConfig::from_path(Path::new("/nonexistent/matrix.toml")).unwrap_err();
        assert!(matches!(err, ConfigurationError::Read { .. }));
    }

    #[test]
    fn test_example_configuration_resolves() {
        let config = PipelineConfig::from_toml_str(include_str!("../../../matrix.example.toml")).unwrap();

        let full = config.plan(FULL_SCHEDULE).unwrap();
        assert_eq!(full.variants.len(), 48);
        assert!(full.tiers.iter().all(|t| t.kind != TierKind::LongIntegration));

        let commit = config.plan("commit").unwrap();
        assert_eq!(commit.variants.len(), 4);
        assert!(commit.variants.iter().all(|(_, p)| p.verify_acceleration));

        let weekly = config.plan("weekly-upgrade").unwrap();
        assert_eq!(weekly.variants.len(), 20);
        assert_eq!(weekly.concurrency, 2);
        assert_eq!(weekly.tiers.len(), 1);
        assert_eq!(weekly.tiers[0].kind, TierKind::Upgrade);
    }
}
