//! Build descriptor written next to the images.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::common::files;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksums {
    pub sha256: String,
    pub sha512: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskEntry {
    /// Disk name from the partition specs (`sda`).
    pub disk: String,
    /// Guest drive it attaches as (`hda`, `hdb`, ...).
    pub target: String,
    /// File name inside the output directory.
    pub file: String,
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bmap: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksums: Option<Checksums>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub name: String,
    pub arch: String,
    pub vcpu: u32,
    /// Guest memory in KiB.
    pub memory_kib: u64,
    pub interfaces: u32,
    /// Tarball in the output directory holding every disk file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
    pub disks: Vec<DiskEntry>,
}

/// Guest drive name for the `index`-th disk.
pub fn drive_target(index: usize) -> String {
    let letter = (b'a' + (index % 26) as u8) as char;
    format!("hd{}", letter)
}

impl ImageDescriptor {
    pub fn file_name(name: &str) -> String {
        format!("{}.json", name)
    }

    /// Write `<outdir>/<name>.json`. Returns its path.
    pub fn write(&self, outdir: &Path) -> Result<PathBuf> {
        let path = outdir.join(Self::file_name(&self.name));
        let json = serde_json::to_string_pretty(self).context("Failed to serialize descriptor")?;
        files::write_file_with_dirs(&path, json + "\n")?;
        Ok(path)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Invalid descriptor {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_targets() {
        assert_eq!(drive_target(0), "hda");
        assert_eq!(drive_target(2), "hdc");
    }

    #[test]
    fn test_write_skips_absent_fields() {
        let dir = tempfile::tempdir().unwrap();
        let desc = ImageDescriptor {
            name: "mini".to_string(),
            arch: "x86_64".to_string(),
            vcpu: 2,
            memory_kib: 512 * 1024,
            interfaces: 1,
            archive: None,
            disks: vec![DiskEntry {
                disk: "sda".to_string(),
                target: drive_target(0),
                file: "mini-sda.raw".to_string(),
                format: "raw".to_string(),
                bmap: None,
                checksums: None,
            }],
        };
        let path = desc.write(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("mini.json"));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("checksums"));
        assert!(!text.contains("archive"));
        assert_eq!(ImageDescriptor::read(&path).unwrap(), desc);
    }
}
