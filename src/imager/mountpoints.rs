//! Mountpoint map of a loop build.
//!
//! A loop build leaves one filesystem image per mountpoint and no partition
//! table to say which is which. The map records it, so the images can be
//! mounted back into one tree later.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::archive;
use crate::common::files;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountpointEntry {
    pub mountpoint: String,
    pub label: String,
    /// Image file name.
    pub name: String,
    /// Filesystem size in bytes.
    pub size: u64,
    pub fstype: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountpointMap {
    pub arch: String,
    pub images: Vec<MountpointEntry>,
}

impl MountpointMap {
    /// `<name>.mountpoints.json`, named after the tarball instead when the
    /// build was packed.
    pub fn file_name(name: &str, pack_to: Option<&str>) -> Result<String> {
        let stem = match pack_to {
            Some(tarball) => archive::tarball_kind(tarball)?.0,
            None => name,
        };
        Ok(format!("{}.mountpoints.json", stem))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize mountpoint map")?;
        files::write_file_with_dirs(path, json + "\n")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid mountpoint map {}", path.display()))
    }
}
