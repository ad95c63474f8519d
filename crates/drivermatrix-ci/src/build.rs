//! Acceleration builder: native extension or pure fallback, per variant.
//!
//! Whether a build is accelerated is decided by what it actually produced
//! (native extension modules in the build tree), never by what was asked
//! for. A variant that asked for acceleration and got a pure build fails
//! with [`BuildError::ModeMismatch`]; there is no silent fallback.

use crate::error::BuildError;
use crate::files::find_native_modules;
use crate::matrix::BuildVariant;
use crate::profile::{AccelMode, VariantProfile};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info};

/// `[build]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuildConfig {
    /// Command building the native extension. `{out_dir}` is substituted.
    pub accelerated_command: Vec<String>,
    /// Command preparing the pure fallback. `{out_dir}` is substituted.
    pub fallback_command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        let command = vec![
            "python".to_string(),
            "setup.py".to_string(),
            "build".to_string(),
            "--build-lib".to_string(),
            "{out_dir}".to_string(),
        ];
        Self {
            accelerated_command: command.clone(),
            fallback_command: command,
            timeout_secs: 1800,
        }
    }
}

/// Unpackaged output of one variant build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildProduct {
    pub variant_id: String,
    pub location: PathBuf,
    /// Whether native extension modules were produced.
    pub accelerated: bool,
    pub duration_ms: u64,
}

/// Build request handed to a backend.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub variant: &'a BuildVariant,
    pub profile: &'a VariantProfile,
    pub out_dir: &'a Path,
}

/// Something that can compile (or prepare) a variant into `out_dir`.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    async fn build(&self, request: &BuildRequest<'_>) -> Result<(), BuildError>;
}

/// Backend running the configured build commands.
#[derive(Debug, Clone)]
pub struct CommandBuildBackend {
    config: BuildConfig,
    workspace: PathBuf,
}

impl CommandBuildBackend {
    pub fn new(config: BuildConfig, workspace: PathBuf) -> Self {
        Self { config, workspace }
    }
}

#[async_trait]
impl BuildBackend for CommandBuildBackend {
    async fn build(&self, request: &BuildRequest<'_>) -> Result<(), BuildError> {
        let accel = request.profile.accel;
        let template = match accel {
            AccelMode::On => &self.config.accelerated_command,
            AccelMode::Off => &self.config.fallback_command,
        };
        let out_dir = request.out_dir.display().to_string();
        let command: Vec<String> = template.iter().map(|a| a.replace("{out_dir}", &out_dir)).collect();
        let Some((exe, args)) = command.split_first() else {
            return Err(BuildError::Spawn(format!("empty {} build command", accel.name())));
        };

        debug!(variant = %request.variant.id(), command = ?command, "Running build command");
        let child = Command::new(exe)
            .args(args)
            .current_dir(&self.workspace)
            .envs(request.profile.process_env())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BuildError::Spawn(format!("{}: {}", exe, e)))?;

        let output = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| BuildError::Timeout {
            timeout_secs: self.config.timeout_secs,
        })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BuildError::Compilation {
                mode: accel.name(),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: tail(&stderr, 2000),
            });
        }

        Ok(())
    }
}

/// Builds variants into per-variant directories under `build_root`.
#[derive(Clone)]
pub struct AccelerationBuilder {
    backend: Arc<dyn BuildBackend>,
    build_root: PathBuf,
}

impl AccelerationBuilder {
    pub fn new(backend: Arc<dyn BuildBackend>, build_root: PathBuf) -> Self {
        Self {
            backend,
            build_root,
        }
    }

    /// Build one variant. Compilation failures propagate; an output whose
    /// accelerated marker disagrees with the variant is rejected.
    pub async fn build(
        &self,
        variant: &BuildVariant,
        profile: &VariantProfile,
    ) -> Result<BuildProduct, BuildError> {
        let start = Instant::now();
        let out_dir = self.build_root.join(variant.id());
        if out_dir.exists() {
            std::fs::remove_dir_all(&out_dir)?;
        }
        std::fs::create_dir_all(&out_dir)?;

        info!(variant = %variant.id(), mode = profile.accel.name(), "Building variant");
        self.backend
            .build(&BuildRequest {
                variant,
                profile,
                out_dir: &out_dir,
            })
            .await?;

        let accelerated = !find_native_modules(&out_dir)?.is_empty();
        if accelerated != profile.accel.is_on() {
            return Err(BuildError::ModeMismatch {
                expected: profile.accel.is_on(),
                actual: accelerated,
            });
        }

        Ok(BuildProduct {
            variant_id: variant.id(),
            location: out_dir,
            accelerated,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

impl std::fmt::Debug for AccelerationBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationBuilder")
            .field("build_root", &self.build_root)
            .finish()
    }
}

/// Assert the code path a tier is about to exercise.
///
/// A fallback build must contain no native extension module; an
/// accelerated build must contain at least one.
pub fn verify_acceleration(location: &Path, expected: AccelMode) -> Result<(), BuildError> {
    let modules = find_native_modules(location)?;
    match expected {
        AccelMode::Off if !modules.is_empty() => Err(BuildError::Verification(format!(
            "fallback build contains {} native module(s), first: {}",
            modules.len(),
            modules[0].display()
        ))),
        AccelMode::On if modules.is_empty() => Err(BuildError::Verification(
            "accelerated build contains no native module".to_string(),
        )),
        _ => Ok(()),
    }
}

fn tail(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{resolve, Axis};
    use crate::profile::{AxisRoles, ProfileSwitches};
    use tempfile::tempdir;

    fn variant_and_profile(accel: &str) -> (BuildVariant, VariantProfile) {
        let axes = vec![Axis::new("runtime", ["3.11"]), Axis::new("accel", [accel])];
        let variant = resolve(&axes, &[]).unwrap().remove(0);
        let profile =
            VariantProfile::from_variant(&variant, &AxisRoles::default(), &ProfileSwitches::default()).unwrap();
        (variant, profile)
    }

    fn shell_config(script: &str) -> BuildConfig {
        let command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        BuildConfig {
            accelerated_command: command.clone(),
            fallback_command: command,
            timeout_secs: 30,
        }
    }

    #[tokio::test]
    async fn test_accelerated_build_via_command() {
        let root = tempdir().unwrap();
        let backend = CommandBuildBackend::new(
            shell_config("mkdir -p {out_dir}/driver && touch {out_dir}/driver/cluster.so"),
            root.path().to_path_buf(),
        );
        let builder = AccelerationBuilder::new(Arc::new(backend), root.path().join("build"));
        let (variant, profile) = variant_and_profile("on");

        let product = builder.build(&variant, &profile).await.unwrap();
        assert!(product.accelerated);
        assert!(product.location.ends_with(variant.id()));
    }

    #[tokio::test]
    async fn test_compile_failure_is_fatal_not_fallback() {
        let root = tempdir().unwrap();
        let backend = CommandBuildBackend::new(shell_config("echo boom >&2; exit 3"), root.path().to_path_buf());
        let builder = AccelerationBuilder::new(Arc::new(backend), root.path().join("build"));
        let (variant, profile) = variant_and_profile("on");

        let err = builder.build(&variant, &profile).await.unwrap_err();
        match err {
            BuildError::Compilation { exit_code, stderr, .. } => {
                assert_eq!(exit_code, 3);
                assert!(stderr.contains("boom"));
            }
            other => panic!("expected Compilation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_fallback_is_mode_mismatch() {
        let root = tempdir().unwrap();
        let backend = CommandBuildBackend::new(
            shell_config("mkdir -p {out_dir}/driver && touch {out_dir}/driver/cluster.py"),
            root.path().to_path_buf(),
        );
        let builder = AccelerationBuilder::new(Arc::new(backend), root.path().join("build"));
        let (variant, profile) = variant_and_profile("on");

        let err = builder.build(&variant, &profile).await.unwrap_err();
        assert!(matches!(
            err,
            BuildError::ModeMismatch {
                expected: true,
                actual: false
            }
        ));
    }

    #[tokio::test]
    async fn test_fallback_build_reads_no_extensions_signal() {
        let root = tempdir().unwrap();
        let backend = CommandBuildBackend::new(
            shell_config(
                "mkdir -p {out_dir}/driver && test \"$DRIVER_NO_EXTENSIONS\" = 1 && touch {out_dir}/driver/cluster.py",
            ),
            root.path().to_path_buf(),
        );
        let builder = AccelerationBuilder::new(Arc::new(backend), root.path().join("build"));
        let (variant, profile) = variant_and_profile("off");

        let product = builder.build(&variant, &profile).await.unwrap();
        assert!(!product.accelerated);
    }

    #[test]
    fn test_verify_acceleration() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("pure.py"), b"").unwrap();
        assert!(verify_acceleration(dir.path(), AccelMode::Off).is_ok());
        assert!(verify_acceleration(dir.path(), AccelMode::On).is_err());

        std::fs::write(dir.path().join("fast.so"), b"").unwrap();
        assert!(verify_acceleration(dir.path(), AccelMode::On).is_ok());
        assert!(matches!(
            verify_acceleration(dir.path(), AccelMode::Off),
            Err(BuildError::Verification(_))
        ));
    }

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("  ab  ", 10), "ab");
    }
}
