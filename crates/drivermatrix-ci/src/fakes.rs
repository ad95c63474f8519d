//! In-memory build backend, ELF editor and tier executor (testing only)
//!
//! Paired with `drivermatrix_env::fakes::FakeProvisioner`, these let a whole
//! matrix run without a compiler, patchelf, a test runner or a cluster.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::build::{BuildBackend, BuildRequest};
use crate::elf::{split_run_path, ElfEditor};
use crate::error::{BuildError, PackagingError};
use crate::profile::AccelMode;
use crate::runner::{TierExecution, TierExecutor, TierInvocation};
use crate::tier::TierKind;

// ---------------------------------------------------------------------------
// FakeBuildBackend
// ---------------------------------------------------------------------------

/// Writes a tiny package tree: `driver/__init__.py`, plus
/// `driver/cluster.so` for accelerated builds. The module is in the text
/// format [`FakeElfEditor`] reads.
#[derive(Debug, Clone, Default)]
pub struct FakeBuildBackend {
    failing: Vec<String>,
    silent_fallback: bool,
    linked_libraries: Vec<String>,
    builds: Arc<Mutex<Vec<String>>>,
}

impl FakeBuildBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail compilation for variants whose signature contains `fragment`.
    pub fn failing(mut self, fragment: impl Into<String>) -> Self {
        self.failing.push(fragment.into());
        self
    }

    /// Accelerated builds quietly produce no native module.
    pub fn with_silent_fallback(mut self) -> Self {
        self.silent_fallback = true;
        self
    }

    /// Libraries the native module of accelerated builds loads.
    pub fn linking(mut self, libraries: &[&str]) -> Self {
        self.linked_libraries = libraries.iter().map(|l| l.to_string()).collect();
        self
    }

    /// Variant ids built so far, in order.
    pub fn builds(&self) -> Vec<String> {
        self.builds.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildBackend for FakeBuildBackend {
    async fn build(&self, request: &BuildRequest<'_>) -> Result<(), BuildError> {
        self.builds.lock().unwrap().push(request.variant.id());

        let signature = request.variant.signature();
        if self.failing.iter().any(|f| signature.contains(f.as_str())) {
            return Err(BuildError::Compilation {
                mode: request.profile.accel.name(),
                exit_code: 1,
                stderr: format!("injected compile failure for {}", signature),
            });
        }

        let pkg = request.out_dir.join("driver");
        std::fs::create_dir_all(&pkg)?;
        std::fs::write(pkg.join("__init__.py"), b"")?;

        let accelerated = request.profile.accel == AccelMode::On && !self.silent_fallback;
        if accelerated {
            let linked: Vec<&str> = self.linked_libraries.iter().map(String::as_str).collect();
            std::fs::write(pkg.join("cluster.so"), FakeElfEditor::module(&linked))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeElfEditor
// ---------------------------------------------------------------------------

/// Edits a text stand-in for a shared object: one `NEEDED <lib>` line per
/// dependency and at most one `RUNPATH <entries>` line. Other lines are
/// left alone.
#[derive(Debug, Clone, Default)]
pub struct FakeElfEditor {
    delay: Duration,
}

impl FakeElfEditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block the calling thread this long on every read.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Contents of a module loading `libraries`.
    pub fn module(libraries: &[&str]) -> String {
        let mut text = String::from("\u{7f}ELF\n");
        for lib in libraries {
            text.push_str(&format!("NEEDED {}\n", lib));
        }
        text
    }

    fn read(&self, module: &Path) -> Result<Vec<String>, PackagingError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(std::fs::read_to_string(module)?.lines().map(String::from).collect())
    }

    fn write(module: &Path, lines: &[String]) -> Result<(), PackagingError> {
        let mut text = lines.join("\n");
        text.push('\n');
        std::fs::write(module, text)?;
        Ok(())
    }
}

impl ElfEditor for FakeElfEditor {
    fn needed(&self, module: &Path) -> Result<Vec<String>, PackagingError> {
        Ok(self
            .read(module)?
            .iter()
            .filter_map(|line| line.strip_prefix("NEEDED "))
            .map(String::from)
            .collect())
    }

    fn run_path(&self, module: &Path) -> Result<Vec<String>, PackagingError> {
        Ok(self
            .read(module)?
            .iter()
            .find_map(|line| line.strip_prefix("RUNPATH "))
            .map(split_run_path)
            .unwrap_or_default())
    }

    fn replace_needed(&self, module: &Path, from: &str, to: &str) -> Result<(), PackagingError> {
        let lines: Vec<String> = self
            .read(module)?
            .into_iter()
            .map(|line| {
                if line.strip_prefix("NEEDED ") == Some(from) {
                    format!("NEEDED {}", to)
                } else {
                    line
                }
            })
            .collect();
        Self::write(module, &lines)
    }

    fn set_run_path(&self, module: &Path, entries: &[String]) -> Result<(), PackagingError> {
        let mut lines: Vec<String> = self
            .read(module)?
            .into_iter()
            .filter(|line| !line.starts_with("RUNPATH "))
            .collect();
        lines.push(format!("RUNPATH {}", entries.join(":")));
        Self::write(module, &lines)
    }
}

// ---------------------------------------------------------------------------
// FakeTierExecutor
// ---------------------------------------------------------------------------

/// Scripted outcome of a fake tier run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierBehavior {
    Pass,
    Fail,
    /// Exit non-zero with only errors in the report.
    ErrorsOnly,
    /// Never finish on its own.
    Hang,
    /// The test process cannot be started.
    SpawnError,
}

#[derive(Debug, Clone)]
struct Rule {
    tier: TierKind,
    variant: Option<String>,
    behavior: TierBehavior,
}

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub tier: TierKind,
    pub build: String,
    pub artifact: String,
    pub contact_points: String,
}

impl Invocation {
    pub fn targets_variant(&self, variant_id: &str) -> bool {
        Path::new(&self.build).ends_with(variant_id)
    }
}

/// Passes every tier unless a rule says otherwise. Writes a JUnit report to
/// the `{report}` path.
#[derive(Debug, Clone, Default)]
pub struct FakeTierExecutor {
    rules: Vec<Rule>,
    invocations: Arc<Mutex<Vec<Invocation>>>,
}

impl FakeTierExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `behavior` to `tier` for every variant.
    pub fn on(mut self, tier: TierKind, behavior: TierBehavior) -> Self {
        self.rules.push(Rule {
            tier,
            variant: None,
            behavior,
        });
        self
    }

    /// Apply `behavior` to `tier` for one variant id.
    pub fn on_variant(mut self, tier: TierKind, variant_id: impl Into<String>, behavior: TierBehavior) -> Self {
        self.rules.push(Rule {
            tier,
            variant: Some(variant_id.into()),
            behavior,
        });
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    fn behavior(&self, invocation: &Invocation) -> TierBehavior {
        self.rules
            .iter()
            .rev()
            .find(|rule| {
                rule.tier == invocation.tier
                    && rule
                        .variant
                        .as_deref()
                        .map_or(true, |id| invocation.targets_variant(id))
            })
            .map_or(TierBehavior::Pass, |rule| rule.behavior)
    }
}

#[async_trait]
impl TierExecutor for FakeTierExecutor {
    async fn execute(&self, invocation: &TierInvocation<'_>) -> anyhow::Result<TierExecution> {
        let placeholders = invocation.placeholders;
        let recorded = Invocation {
            tier: invocation.tier.kind,
            build: placeholders.get("build").unwrap_or_default().to_string(),
            artifact: placeholders.get("artifact").unwrap_or_default().to_string(),
            contact_points: placeholders.get("contact_points").unwrap_or_default().to_string(),
        };
        self.invocations.lock().unwrap().push(recorded.clone());

        let (exit_code, failures, errors) = match self.behavior(&recorded) {
            TierBehavior::Pass => (0, 0, 0),
            TierBehavior::Fail => (1, 2, 0),
            TierBehavior::ErrorsOnly => (1, 0, 3),
            TierBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                (0, 0, 0)
            }
            TierBehavior::SpawnError => {
                anyhow::bail!("Tier {} could not start pytest: not found", recorded.tier)
            }
        };

        if let Some(report) = placeholders.get("report") {
            let report = Path::new(report);
            if let Some(parent) = report.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(
                report,
                format!(
                    "<testsuites><testsuite name=\"fake\" tests=\"10\" failures=\"{}\" errors=\"{}\" skipped=\"0\"/></testsuites>",
                    failures, errors
                ),
            )?;
        }

        Ok(TierExecution {
            exit_code,
            stdout: format!("{} fake tests", recorded.tier),
            stderr: String::new(),
            duration_ms: 1,
            success: exit_code == 0,
        })
    }
}
