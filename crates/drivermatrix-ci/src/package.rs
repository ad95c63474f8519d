//! Artifact packager.
//!
//! Turns a build product into a runtime-ABI and platform tagged artifact.
//! Artifacts are directories laid out like an unpacked wheel and named with
//! the wheel convention, with the variant id as build tag so two variants
//! never share a location.

use crate::build::BuildProduct;
use crate::error::PackagingError;
use crate::files::{copy_tree, digest_tree};
use crate::matrix::BuildVariant;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Manifest written at the root of every artifact.
pub const MANIFEST_FILE: &str = "ARTIFACT.json";

/// `[packaging]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PackagingConfig {
    /// ABI tags the release supports. Empty means every runtime on the axis.
    pub declared_abi_tags: Vec<String>,
    /// ABI tags skipped by policy, e.g. deprecated interpreters.
    pub excluded_abi_tags: Vec<String>,
    /// ABI tags the build environment can produce. Empty means any.
    pub available_abi_tags: Vec<String>,
    /// Runtime value to ABI tag, for runtimes the default mapping gets wrong.
    pub abi_overrides: BTreeMap<String, String>,
    /// Shared libraries every conforming platform provides.
    pub baseline_libs: Vec<String>,
    /// Directories searched for libraries that must be vendored.
    pub library_search_paths: Vec<PathBuf>,
    /// `patchelf` executable used to read and rewrite native modules.
    pub patchelf: PathBuf,
}

impl Default for PackagingConfig {
    fn default() -> Self {
        Self {
            declared_abi_tags: Vec::new(),
            excluded_abi_tags: Vec::new(),
            available_abi_tags: Vec::new(),
            abi_overrides: BTreeMap::new(),
            baseline_libs: [
                "libc.so.6",
                "libm.so.6",
                "libdl.so.2",
                "librt.so.1",
                "libpthread.so.0",
                "libgcc_s.so.1",
                "libstdc++.so.6",
                "ld-linux-x86-64.so.2",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            library_search_paths: vec![
                PathBuf::from("/usr/lib"),
                PathBuf::from("/usr/lib64"),
                PathBuf::from("/usr/local/lib"),
                PathBuf::from("/usr/lib/x86_64-linux-gnu"),
            ],
            patchelf: PathBuf::from("patchelf"),
        }
    }
}

/// What to do about a variant's runtime ABI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiPlan {
    Build(String),
    Excluded { tag: String, reason: String },
}

impl PackagingConfig {
    /// `3.10` becomes `cp310` unless an override names the tag.
    pub fn abi_tag_for(&self, runtime: &str) -> String {
        if let Some(tag) = self.abi_overrides.get(runtime) {
            return tag.clone();
        }
        let digits: String = runtime
            .split('.')
            .take(2)
            .collect::<Vec<_>>()
            .concat()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        format!("cp{}", digits)
    }

    /// Decide whether a runtime's ABI is built at all. Runs before any
    /// build work is spent on the variant.
    pub fn plan(&self, runtime: &str) -> AbiPlan {
        let tag = self.abi_tag_for(runtime);
        if self.excluded_abi_tags.contains(&tag) {
            return AbiPlan::Excluded {
                reason: format!("ABI tag {} is excluded by policy", tag),
                tag,
            };
        }
        if !self.declared_abi_tags.is_empty() && !self.declared_abi_tags.contains(&tag) {
            return AbiPlan::Excluded {
                reason: format!("ABI tag {} is not declared for this release", tag),
                tag,
            };
        }
        AbiPlan::Build(tag)
    }

    fn abi_available(&self, tag: &str) -> bool {
        self.available_abi_tags.is_empty() || self.available_abi_tags.iter().any(|t| t == tag)
    }
}

/// One vendored shared library inside a repaired artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VendoredDependency {
    /// Library name as the extension links it, e.g. `libev.so.4`.
    pub name: String,
    /// Version taken from the resolved file name.
    pub version: String,
    /// Path of the vendored copy, relative to the artifact root.
    pub vendored_as: String,
    pub sha256: String,
}

/// Contents of `ARTIFACT.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactManifest {
    pub library: String,
    pub version: String,
    pub variant_id: String,
    pub signature: String,
    pub abi_tag: String,
    pub platform_tag: String,
    pub accelerated: bool,
    /// External shared libraries the artifact's native modules still load
    /// from the system. Recorded by repair, which reads the modules.
    #[serde(default)]
    pub needed: Vec<String>,
    #[serde(default)]
    pub vendored: Vec<VendoredDependency>,
}

impl ArtifactManifest {
    pub fn read(artifact: &Path) -> Result<Self, PackagingError> {
        let bytes = std::fs::read(artifact.join(MANIFEST_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn write(&self, artifact: &Path) -> Result<(), PackagingError> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(artifact.join(MANIFEST_FILE), json)?;
        Ok(())
    }
}

/// A packaged artifact. Read-only once published.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub variant_id: String,
    pub signature: String,
    pub abi_tag: String,
    pub platform_tag: String,
    pub accelerated: bool,
    pub location: PathBuf,
    pub file_name: String,
    /// SHA-256 over the artifact's files, manifest excluded.
    pub content_digest: String,
}

/// `<dist>-<version>-<variant id>-<abi>-<abi>-<platform>.whl`
pub fn artifact_file_name(
    library: &str,
    version: &str,
    variant_id: &str,
    abi_tag: &str,
    platform_tag: &str,
) -> String {
    format!(
        "{}-{}-{}-{}-{}-{}.whl",
        distribution_name(library),
        version,
        variant_id,
        abi_tag,
        abi_tag,
        platform_tag
    )
}

/// Wheel distribution name: runs of `-`, `.` and `_` become one `_`.
pub fn distribution_name(library: &str) -> String {
    let mut out = String::with_capacity(library.len());
    for c in library.chars() {
        if matches!(c, '-' | '.' | '_') {
            if !out.ends_with('_') {
                out.push('_');
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Packages build products into `dist_dir`.
#[derive(Debug, Clone)]
pub struct ArtifactPackager {
    library: String,
    version: String,
    platform_tag: String,
    config: PackagingConfig,
    dist_dir: PathBuf,
}

impl ArtifactPackager {
    pub fn new(
        library: impl Into<String>,
        version: impl Into<String>,
        platform_tag: impl Into<String>,
        config: PackagingConfig,
        dist_dir: PathBuf,
    ) -> Self {
        Self {
            library: library.into(),
            version: version.into(),
            platform_tag: platform_tag.into(),
            config,
            dist_dir,
        }
    }

    pub fn config(&self) -> &PackagingConfig {
        &self.config
    }

    pub fn library(&self) -> &str {
        &self.library
    }

    /// Package `product` for `abi_tag`.
    pub fn package(
        &self,
        product: &BuildProduct,
        variant: &BuildVariant,
        abi_tag: &str,
    ) -> Result<ArtifactDescriptor, PackagingError> {
        if !self.config.abi_available(abi_tag) {
            return Err(PackagingError::AbiUnavailable(abi_tag.to_string()));
        }

        let file_name = artifact_file_name(
            &self.library,
            &self.version,
            &product.variant_id,
            abi_tag,
            &self.platform_tag,
        );
        let location = self.dist_dir.join(&file_name);
        if location.exists() {
            return Err(PackagingError::LocationCollision(location.display().to_string()));
        }

        debug!(variant = %product.variant_id, artifact = %file_name, "Packaging build product");
        copy_tree(&product.location, &location)?;

        let manifest = ArtifactManifest {
            library: self.library.clone(),
            version: self.version.clone(),
            variant_id: product.variant_id.clone(),
            signature: variant.signature(),
            abi_tag: abi_tag.to_string(),
            platform_tag: self.platform_tag.clone(),
            accelerated: product.accelerated,
            needed: Vec::new(),
            vendored: Vec::new(),
        };
        manifest.write(&location)?;
        let content_digest = digest_tree(&location, MANIFEST_FILE)?;

        info!(variant = %product.variant_id, artifact = %file_name, "Artifact packaged");
        Ok(ArtifactDescriptor {
            variant_id: product.variant_id.clone(),
            signature: manifest.signature,
            abi_tag: manifest.abi_tag,
            platform_tag: manifest.platform_tag,
            accelerated: product.accelerated,
            location,
            file_name,
            content_digest,
        })
    }
}
