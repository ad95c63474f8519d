//! Filesystem helpers shared by the build, packaging and repair steps.

use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};

/// Simple recursive file walker, sorted for determinism.
pub fn walk_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if dir.is_dir() {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                files.extend(walk_files(&path)?);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Copy the tree under `from` into `to` (created if missing).
pub fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    std::fs::create_dir_all(to)?;
    for file in walk_files(from)? {
        let relative = file.strip_prefix(from).map_err(io::Error::other)?;
        let target = to.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&file, &target)?;
    }
    Ok(())
}

/// SHA-256 over relative paths and contents of every file under `dir`,
/// skipping `exclude` (a file name at the tree root).
pub fn digest_tree(dir: &Path, exclude: &str) -> io::Result<String> {
    let mut hasher = Sha256::new();
    for file in walk_files(dir)? {
        let relative = file.strip_prefix(dir).map_err(io::Error::other)?;
        if relative == Path::new(exclude) {
            continue;
        }
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        hasher.update(std::fs::read(&file)?);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of one file.
pub fn digest_file(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(std::fs::read(path)?);
    Ok(hex::encode(hasher.finalize()))
}

/// Native extension modules under `dir`, ignoring vendored `*.libs` trees.
pub fn find_native_modules(dir: &Path) -> io::Result<Vec<PathBuf>> {
    Ok(walk_files(dir)?
        .into_iter()
        .filter(|path| {
            let vendored = path
                .strip_prefix(dir)
                .map(|rel| {
                    rel.components()
                        .any(|c| c.as_os_str().to_string_lossy().ends_with(".libs"))
                })
                .unwrap_or(false);
            let native = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("so") | Some("pyd") | Some("dylib")
            );
            native && !vendored
        })
        .collect())
}
