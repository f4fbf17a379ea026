//! Scratch work directories.

use anyhow::{Context, Result};
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// A work directory removed when dropped.
///
/// Call [`ScratchDir::keep`] when the tree must survive, e.g. because a
/// mount inside it could not be released.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    keep: bool,
}

impl ScratchDir {
    /// Prepare `parent/name`, removing a leftover from a previous run.
    pub fn create(parent: &Path, name: &str) -> Result<Self> {
        let path = prepare_work_dir(parent, name)?;
        debug!("scratch dir {}", path.display());
        Ok(Self { path, keep: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.path.join(rel)
    }

    pub fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.keep {
            warn!("leaving scratch dir {} in place", self.path.display());
        } else {
            cleanup_work_dir(&self.path);
        }
    }
}

/// Prepare a work directory, removing it if it exists and creating it fresh.
pub fn prepare_work_dir(parent_dir: &Path, name: &str) -> Result<PathBuf> {
    let work_dir = parent_dir.join(name);

    if work_dir.exists() {
        fs::remove_dir_all(&work_dir)
            .with_context(|| format!("Failed to clear {}", work_dir.display()))?;
    }
    fs::create_dir_all(&work_dir)
        .with_context(|| format!("Failed to create {}", work_dir.display()))?;

    Ok(work_dir)
}

/// Remove a work directory tree. Idempotent.
pub fn cleanup_work_dir(path: &Path) {
    let _ = fs::remove_dir_all(path);
}
