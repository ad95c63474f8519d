//! Artifact repair: vendor shared libraries outside the platform baseline.
//!
//! The dependency set comes from the artifact itself: every native module's
//! `DT_NEEDED` list is read through an [`ElfEditor`]. Each library that is
//! neither in the baseline nor already vendored is copied into
//! `<dist>.libs/` under a hashed name. The module's needed entry is then
//! rewritten to that name and its run path pointed at the libs directory
//! relative to `$ORIGIN`, so the loader finds the vendored copy without any
//! system install. All dependencies are resolved before anything is
//! written, and the rewritten artifact is assembled in a staging directory
//! that only replaces the original once it checks out as portable.

use crate::elf::{origin_run_path, ElfEditor};
use crate::error::PackagingError;
use crate::files::{copy_tree, digest_file, digest_tree, find_native_modules};
use crate::package::{distribution_name, ArtifactDescriptor, ArtifactManifest, VendoredDependency, MANIFEST_FILE};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// An artifact that loads nothing outside the platform baseline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepairedArtifact {
    pub descriptor: ArtifactDescriptor,
    /// External libraries still loaded from the system (baseline only).
    pub needed: Vec<String>,
    pub vendored: Vec<VendoredDependency>,
}

impl RepairedArtifact {
    pub fn location(&self) -> &Path {
        &self.descriptor.location
    }

    pub fn vendored_names(&self) -> Vec<&str> {
        self.vendored.iter().map(|v| v.name.as_str()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactRepairer {
    baseline: BTreeSet<String>,
    search_paths: Vec<PathBuf>,
    editor: Arc<dyn ElfEditor>,
}

struct Resolved {
    name: String,
    path: PathBuf,
}

/// One native module and what it loads. `path` is relative to the artifact root.
struct Module {
    path: PathBuf,
    needed: Vec<String>,
}

impl ArtifactRepairer {
    pub fn new(
        baseline: impl IntoIterator<Item = String>,
        search_paths: Vec<PathBuf>,
        editor: Arc<dyn ElfEditor>,
    ) -> Self {
        Self {
            baseline: baseline.into_iter().collect(),
            search_paths,
            editor,
        }
    }

    pub fn in_baseline(&self, library: &str) -> bool {
        self.baseline.contains(library)
    }

    /// Repair `artifact` in place. Repairing an already repaired artifact
    /// changes nothing.
    pub fn repair(&self, artifact: &ArtifactDescriptor) -> Result<RepairedArtifact, PackagingError> {
        let root = &artifact.location;
        let mut manifest = ArtifactManifest::read(root)?;
        let libs_dir = format!("{}.libs", distribution_name(&manifest.library));
        let modules = self.inspect(root)?;

        let external: BTreeSet<&str> = modules
            .iter()
            .flat_map(|m| m.needed.iter())
            .filter(|lib| !self.satisfied(root, &libs_dir, lib))
            .map(String::as_str)
            .collect();

        if external.is_empty() {
            debug!(artifact = %artifact.file_name, "Nothing to vendor");
            let needed = self.system_needed(&modules);
            if manifest.needed != needed {
                manifest.needed = needed;
                manifest.write(root)?;
            }
            return Ok(RepairedArtifact {
                descriptor: artifact.clone(),
                needed: manifest.needed,
                vendored: manifest.vendored,
            });
        }

        let resolved = external
            .iter()
            .map(|name| self.locate(name))
            .collect::<Result<Vec<_>, _>>()?;

        let parent = root
            .parent()
            .ok_or_else(|| PackagingError::LocationCollision(root.display().to_string()))?;
        let staging = tempfile::Builder::new()
            .prefix(".repair-")
            .tempdir_in(parent)?;
        copy_tree(root, staging.path())?;

        std::fs::create_dir_all(staging.path().join(&libs_dir))?;
        let mut renamed = BTreeMap::new();
        for lib in &resolved {
            let (vendored, file_name) = vendor(lib, staging.path(), &libs_dir)?;
            debug!(library = %lib.name, vendored_as = %vendored.vendored_as, "Vendored dependency");
            renamed.insert(lib.name.clone(), file_name);
            manifest.vendored.push(vendored);
        }

        for module in &modules {
            let staged = staging.path().join(&module.path);
            let mut rewritten = false;
            for lib in &module.needed {
                if let Some(file_name) = renamed.get(lib) {
                    self.editor.replace_needed(&staged, lib, file_name)?;
                    rewritten = true;
                }
            }
            if rewritten {
                let origin = origin_run_path(&module.path, &libs_dir);
                let mut entries = vec![origin.clone()];
                entries.extend(
                    self.editor
                        .run_path(&staged)?
                        .into_iter()
                        .filter(|e| e.starts_with("$ORIGIN") && *e != origin),
                );
                self.editor.set_run_path(&staged, &entries)?;
                debug!(module = %module.path.display(), run_path = %entries.join(":"), "Rewrote module load path");
            }
        }

        let repaired = self.inspect(staging.path())?;
        self.check_portable(staging.path(), &libs_dir, &repaired)?;
        manifest.needed = self.system_needed(&repaired);
        manifest.write(staging.path())?;
        let content_digest = digest_tree(staging.path(), MANIFEST_FILE)?;

        replace_dir(staging.keep(), root)?;

        info!(
            artifact = %artifact.file_name,
            vendored = resolved.len(),
            modules = modules.len(),
            "Artifact repaired"
        );
        Ok(RepairedArtifact {
            descriptor: ArtifactDescriptor {
                content_digest,
                ..artifact.clone()
            },
            needed: manifest.needed,
            vendored: manifest.vendored,
        })
    }

    fn inspect(&self, root: &Path) -> Result<Vec<Module>, PackagingError> {
        find_native_modules(root)?
            .into_iter()
            .map(|path| -> Result<Module, PackagingError> {
                let needed = self.editor.needed(&path)?;
                let path = path
                    .strip_prefix(root)
                    .map_err(std::io::Error::other)?
                    .to_path_buf();
                Ok(Module { path, needed })
            })
            .collect()
    }

    /// Baseline libraries and libraries already vendored into `libs_dir`
    /// need no work.
    fn satisfied(&self, root: &Path, libs_dir: &str, library: &str) -> bool {
        self.in_baseline(library) || root.join(libs_dir).join(library).is_file()
    }

    fn system_needed(&self, modules: &[Module]) -> Vec<String> {
        modules
            .iter()
            .flat_map(|m| m.needed.iter())
            .filter(|lib| self.in_baseline(lib))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn check_portable(&self, root: &Path, libs_dir: &str, modules: &[Module]) -> Result<(), PackagingError> {
        for module in modules {
            if let Some(library) = module.needed.iter().find(|lib| !self.satisfied(root, libs_dir, lib)) {
                return Err(PackagingError::NotPortable {
                    module: module.path.display().to_string(),
                    library: library.clone(),
                });
            }
        }
        Ok(())
    }

    fn locate(&self, library: &str) -> Result<Resolved, PackagingError> {
        self.search_paths
            .iter()
            .map(|dir| dir.join(library))
            .find(|candidate| candidate.is_file())
            .map(|candidate| {
                let path = std::fs::canonicalize(&candidate).unwrap_or(candidate);
                Resolved {
                    name: library.to_string(),
                    path,
                }
            })
            .ok_or_else(|| PackagingError::UnresolvedDependency {
                library: library.to_string(),
                searched: self.search_paths.len(),
            })
    }
}

/// Split `libev.so.4.0.0` into (`libev`, `4.0.0`).
pub fn split_library_name(file_name: &str) -> (String, String) {
    match file_name.find(".so") {
        Some(idx) => {
            let stem = &file_name[..idx];
            let version = file_name[idx + 3..].trim_start_matches('.');
            (stem.to_string(), version.to_string())
        }
        None => (file_name.to_string(), String::new()),
    }
}

/// Copy `lib` into `libs_dir`. Returns the manifest entry and the vendored file name.
fn vendor(lib: &Resolved, root: &Path, libs_dir: &str) -> Result<(VendoredDependency, String), PackagingError> {
    let resolved_name = lib
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| lib.name.clone());
    let (stem, version) = split_library_name(&resolved_name);
    let sha256 = digest_file(&lib.path)?;

    let file_name = if version.is_empty() {
        format!("{}-{}.so", stem, &sha256[..8])
    } else {
        format!("{}-{}.so.{}", stem, &sha256[..8], version)
    };
    let vendored_as = format!("{}/{}", libs_dir, file_name);
    std::fs::copy(&lib.path, root.join(&vendored_as))?;

    Ok((
        VendoredDependency {
            name: lib.name.clone(),
            version,
            vendored_as,
            sha256,
        },
        file_name,
    ))
}

fn replace_dir(staged: PathBuf, target: &Path) -> std::io::Result<()> {
    let mut backup = target.as_os_str().to_owned();
    backup.push(".orig");
    let backup = PathBuf::from(backup);
    std::fs::rename(target, &backup)?;
    if let Err(e) = std::fs::rename(&staged, target) {
        std::fs::rename(&backup, target)?;
        let _ = std::fs::remove_dir_all(&staged);
        return Err(e);
    }
    std::fs::remove_dir_all(&backup)
}
