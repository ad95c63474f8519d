//! Dynamic-section access for native extension modules.
//!
//! Repair reads each module's `DT_NEEDED` list to find what it loads and
//! rewrites the entries and the run path so the loader finds vendored
//! copies. [`Patchelf`] does this through the `patchelf` tool. Calls block,
//! so repair runs on the blocking pool.

use crate::error::PackagingError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Reads and rewrites the dynamic section of a shared object.
pub trait ElfEditor: Send + Sync + fmt::Debug {
    /// `DT_NEEDED` entries, in load order.
    fn needed(&self, module: &Path) -> Result<Vec<String>, PackagingError>;

    /// Run path entries (`DT_RUNPATH`, or `DT_RPATH` when that is all there is).
    fn run_path(&self, module: &Path) -> Result<Vec<String>, PackagingError>;

    fn replace_needed(&self, module: &Path, from: &str, to: &str) -> Result<(), PackagingError>;

    fn set_run_path(&self, module: &Path, entries: &[String]) -> Result<(), PackagingError>;
}

/// [`ElfEditor`] backed by the `patchelf` executable.
#[derive(Debug, Clone)]
pub struct Patchelf {
    binary: PathBuf,
}

impl Patchelf {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    fn run(&self, args: &[&str], module: &Path) -> Result<String, PackagingError> {
        debug!(tool = %self.binary.display(), args = ?args, module = %module.display(), "Running patchelf");
        let output = Command::new(&self.binary)
            .args(args)
            .arg(module)
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    PackagingError::ToolNotFound(self.binary.display().to_string())
                } else {
                    PackagingError::Io(e)
                }
            })?;

        if !output.status.success() {
            return Err(PackagingError::ToolFailed {
                command: format!("{} {} {}", self.binary.display(), args.join(" "), module.display()),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for Patchelf {
    fn default() -> Self {
        Self::new("patchelf")
    }
}

impl ElfEditor for Patchelf {
    fn needed(&self, module: &Path) -> Result<Vec<String>, PackagingError> {
        let out = self.run(&["--print-needed"], module)?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    fn run_path(&self, module: &Path) -> Result<Vec<String>, PackagingError> {
        let out = self.run(&["--print-rpath"], module)?;
        Ok(split_run_path(out.trim()))
    }

    fn replace_needed(&self, module: &Path, from: &str, to: &str) -> Result<(), PackagingError> {
        self.run(&["--replace-needed", from, to], module).map(|_| ())
    }

    fn set_run_path(&self, module: &Path, entries: &[String]) -> Result<(), PackagingError> {
        let joined = entries.join(":");
        self.run(&["--set-rpath", joined.as_str()], module).map(|_| ())
    }
}

/// Split a colon-separated run path, dropping empty entries.
pub fn split_run_path(run_path: &str) -> Vec<String> {
    run_path
        .split(':')
        .filter(|e| !e.is_empty())
        .map(String::from)
        .collect()
}

/// `$ORIGIN`-relative run path from the module at `module` (relative to
/// the artifact root) to `libs_dir` at the artifact root.
pub fn origin_run_path(module: &Path, libs_dir: &str) -> String {
    let depth = module.parent().map_or(0, |dir| dir.components().count());
    let mut path = String::from("$ORIGIN");
    for _ in 0..depth {
        path.push_str("/..");
    }
    path.push('/');
    path.push_str(libs_dir);
    path
}
