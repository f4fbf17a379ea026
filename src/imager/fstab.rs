//! `/etc/fstab` for the installed image.

use anyhow::Result;
use std::path::Path;

use super::layout::PlacedPartition;
use crate::common::files;
use crate::kickstart::PartitionSpec;

const DEFAULT_OPTIONS: &str = "defaults,noatime";

const PSEUDO_ENTRIES: &[(&str, &str, &str, &str)] = &[
    ("devpts", "/dev/pts", "devpts", "gid=5,mode=620"),
    ("tmpfs", "/dev/shm", "tmpfs", "defaults"),
    ("proc", "/proc", "proc", "defaults"),
    ("sysfs", "/sys", "sysfs", "defaults"),
];

fn line(device: &str, mountpoint: &str, fstype: &str, options: &str) -> String {
    format!("{}  {}  {}  {} 0 0\n", device, mountpoint, fstype, options)
}

/// A mounted filesystem and the name fstab finds it by.
pub struct Entry<'a> {
    pub device: String,
    pub spec: &'a PartitionSpec,
}

impl<'a> Entry<'a> {
    pub fn partition(part: &'a PlacedPartition) -> Self {
        let device = match &part.spec.uuid {
            Some(uuid) => format!("UUID={}", uuid),
            None => format!("/dev/{}{}", part.disk, part.num),
        };
        Self { device, spec: &part.spec }
    }

    pub fn labelled(label: &str, spec: &'a PartitionSpec) -> Self {
        Self {
            device: format!("LABEL={}", label),
            spec,
        }
    }
}

/// Render fstab for `entries`, given in mount order.
pub fn render(entries: &[Entry<'_>]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&line(
            &entry.device,
            &entry.spec.mountpoint,
            entry.spec.fstype.as_deref().unwrap_or("auto"),
            entry.spec.fsopts.as_deref().unwrap_or(DEFAULT_OPTIONS),
        ));
    }
    for (device, mountpoint, fstype, options) in PSEUDO_ENTRIES {
        out.push_str(&line(device, mountpoint, fstype, options));
    }
    out
}

pub fn write(install_root: &Path, entries: &[Entry<'_>]) -> Result<()> {
    files::write_file_with_dirs(install_root.join("etc/fstab"), render(entries))
}
