//! File helpers that create parent directories as they go.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Write a file, creating parent directories as needed.
pub fn write_file_with_dirs<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Copy one file, creating the destination's parent directories.
pub fn copy_file_with_dirs(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::copy(src, dest)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dest.display()))?;
    Ok(())
}

/// Recursively copy `src` to `dest`, keeping symlinks as symlinks. Returns the
/// number of files copied.
///
/// When `dest` lies inside `src` the destination subtree is not descended
/// into.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<usize> {
    let mut copied = 0;
    let walker = WalkDir::new(src)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !e.path().starts_with(dest));

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if fs::symlink_metadata(&target).is_ok() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("Failed to create symlink {}", target.display()))?;
        } else {
            copy_file_with_dirs(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_tree_keeps_links() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("plugins/imager")).unwrap();
        fs::write(src.join("plugins/imager/raw.so"), "x").unwrap();
        fs::write(src.join("top"), "y").unwrap();
        std::os::unix::fs::symlink("top", src.join("alias")).unwrap();

        let dest = dir.path().join("dest");
        assert_eq!(copy_tree(&src, &dest).unwrap(), 2);
        assert_eq!(fs::read_to_string(dest.join("plugins/imager/raw.so")).unwrap(), "x");
        assert_eq!(
            fs::read_link(dest.join("alias")).unwrap(),
            std::path::PathBuf::from("top")
        );
    }

    #[test]
    fn test_copy_tree_into_itself() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("lib");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("f"), "z").unwrap();

        let dest = src.join("copy");
        assert_eq!(copy_tree(&src, &dest).unwrap(), 1);
        assert!(!dest.join("copy").exists());
    }
}
