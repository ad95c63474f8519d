//! Tier process execution.

use crate::profile::VariantProfile;
use crate::tier::{TierConfig, EXECUTION_MODE_ENV};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::debug;

/// Result of running one tier's test process.
#[derive(Debug, Clone)]
pub struct TierExecution {
    /// Exit code (-1 when killed by a signal).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether execution succeeded.
    pub success: bool,
}

impl TierExecution {
    /// Whether this tier passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }
}

/// Values substituted into `{name}` placeholders of tier commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placeholders {
    values: BTreeMap<&'static str, String>,
}

impl Placeholders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.values.insert(name, value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Replace every known `{name}`; unknown placeholders are left as is.
    pub fn substitute(&self, arg: &str) -> String {
        let mut out = arg.to_string();
        for (name, value) in &self.values {
            out = out.replace(&format!("{{{}}}", name), value);
        }
        out
    }
}

/// One tier invocation for one variant.
#[derive(Debug, Clone, Copy)]
pub struct TierInvocation<'a> {
    pub tier: &'a TierConfig,
    pub profile: &'a VariantProfile,
    pub placeholders: &'a Placeholders,
    pub work_dir: &'a Path,
}

/// Runs a tier's test process. The caller bounds it with the tier timeout;
/// dropping the future must stop the process.
#[async_trait]
pub trait TierExecutor: Send + Sync {
    async fn execute(&self, invocation: &TierInvocation<'_>) -> anyhow::Result<TierExecution>;
}

/// Executor spawning the tier command as a child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandTierExecutor;

#[async_trait]
impl TierExecutor for CommandTierExecutor {
    async fn execute(&self, invocation: &TierInvocation<'_>) -> anyhow::Result<TierExecution> {
        let start = Instant::now();
        let tier = invocation.tier;

        if tier.command.is_empty() {
            anyhow::bail!("Tier {} has empty command", tier.kind);
        }

        let command: Vec<String> = tier
            .command_line()
            .iter()
            .map(|arg| invocation.placeholders.substitute(arg))
            .collect();
        let exe = &command[0];
        let args = &command[1..];
        debug!(tier = %tier.kind, command = ?command, "Spawning tier process");

        let child = Command::new(exe)
            .args(args)
            .current_dir(invocation.work_dir)
            .envs(invocation.profile.process_env())
            .env(EXECUTION_MODE_ENV, tier.mode.name())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("Tier {} could not start {}: {}", tier.kind, exe, e))?;

        let output = child.wait_with_output().await?;

        Ok(TierExecution {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: output.status.success(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{resolve, Axis};
    use crate::profile::{AxisRoles, ProfileSwitches};
    use crate::tier::{ExecutionMode, TierKind};

    fn profile() -> VariantProfile {
        let variant = resolve(&[Axis::new("backend", ["asyncio"]), Axis::new("accel", ["off"])], &[])
            .unwrap()
            .remove(0);
        VariantProfile::from_variant(&variant, &AxisRoles::default(), &ProfileSwitches::default()).unwrap()
    }

    async fn run(command: &[&str], placeholders: &Placeholders) -> anyhow::Result<TierExecution> {
        let tier = TierConfig::custom(
            TierKind::Unit,
            command.iter().map(|s| s.to_string()).collect(),
            60,
        );
        run_tier(&tier, placeholders).await
    }

    async fn run_tier(tier: &TierConfig, placeholders: &Placeholders) -> anyhow::Result<TierExecution> {
        let profile = profile();
        let dir = std::env::temp_dir();
        CommandTierExecutor
            .execute(&TierInvocation {
                tier,
                profile: &profile,
                placeholders,
                work_dir: &dir,
            })
            .await
    }

    #[test]
    fn test_placeholder_substitution() {
        let placeholders = Placeholders::new()
            .set("report", "/out/unit_results.xml")
            .set("server_version", "4.0");
        assert_eq!(
            placeholders.substitute("--junit-xml={report}"),
            "--junit-xml=/out/unit_results.xml"
        );
        assert_eq!(placeholders.substitute("{server_version}-{other}"), "4.0-{other}");
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let result = run(&["echo", "hello"], &Placeholders::new()).await.expect("execute failed");
        assert!(result.passed());
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let result = run(&["false"], &Placeholders::new()).await.expect("execute failed");
        assert!(!result.passed());
        assert_ne!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_profile_signals_reach_process() {
        let result = run(
            &["sh", "-c", "echo $EVENT_LOOP_MANAGER $DRIVER_NO_EXTENSIONS {build}"],
            &Placeholders::new().set("build", "/tmp/b"),
        )
        .await
        .unwrap();
        assert_eq!(result.stdout.trim(), "asyncio 1 /tmp/b");
    }

    #[tokio::test]
    async fn test_execution_mode_reaches_process() {
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo $DRIVERMATRIX_EXECUTION_MODE \"$@\"".to_string(),
            "sh".to_string(),
        ];
        let isolated = TierConfig::custom(TierKind::Unit, command, 60)
            .with_mode(ExecutionMode::SupportsIsolation, vec!["--forked".to_string()]);
        let result = run_tier(&isolated, &Placeholders::new()).await.unwrap();
        assert_eq!(result.stdout.trim(), "supports-isolation --forked");

        let sequential = isolated.with_mode(ExecutionMode::Sequential, vec!["--forked".to_string()]);
        let result = run_tier(&sequential, &Placeholders::new()).await.unwrap();
        assert_eq!(result.stdout.trim(), "sequential");
    }

    #[tokio::test]
    async fn test_missing_executable_is_error() {
        let err = run(&["definitely-not-a-real-binary-xyz"], &Placeholders::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("could not start"));
    }
}
