//! Per-disk sizing and sparse backing files.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::kickstart::PartitionSpec;

/// One disk referenced by the partition specs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDescriptor {
    pub name: String,
    /// Sum of partition sizes plus alignment padding, in bytes.
    pub size: u64,
    /// Partitions on this disk, in declaration order.
    pub partitions: Vec<PartitionSpec>,
    /// Sparse backing file, once created.
    pub image: Option<PathBuf>,
    /// Loop device the image is attached to.
    pub device: Option<String>,
}

impl DiskDescriptor {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            size: 0,
            partitions: Vec::new(),
            image: None,
            device: None,
        }
    }

    fn add(&mut self, spec: &PartitionSpec) {
        self.size += spec.size + spec.align.unwrap_or(0);
        self.partitions.push(spec.clone());
    }

    /// True when every partition is excluded from the emitted images.
    pub fn is_excluded(&self) -> bool {
        self.partitions.iter().all(|p| p.exclude_from_image)
    }
}

/// Group `specs` by disk, in order of first reference.
///
/// Every spec must name a disk and a filesystem type; otherwise the whole
/// plan is rejected before anything touches the host.
pub fn plan_disks(specs: &[PartitionSpec]) -> Result<Vec<DiskDescriptor>> {
    let mut disks: Vec<DiskDescriptor> = Vec::new();

    for spec in specs {
        let Some(disk) = spec.disk.as_deref().filter(|d| !d.is_empty()) else {
            return Err(Error::Build(format!(
                "partition {} has no target disk (--ondisk)",
                spec.mountpoint
            )));
        };
        if spec.fstype.as_deref().map_or(true, str::is_empty) {
            return Err(Error::Build(format!(
                "partition {} has no filesystem type (--fstype)",
                spec.mountpoint
            )));
        }

        match disks.iter_mut().find(|d| d.name == disk) {
            Some(existing) => existing.add(spec),
            None => {
                let mut new = DiskDescriptor::new(disk);
                new.add(spec);
                disks.push(new);
            }
        }
    }
    Ok(disks)
}

/// File name of a disk's raw image.
pub fn image_file_name(image_name: &str, disk: &str) -> String {
    format!("{}-{}.raw", image_name, disk)
}

/// Create (or truncate) a sparse file of `size` bytes.
pub fn create_sparse(path: &Path, size: u64) -> Result<()> {
    let file = fs::File::create(path).map_err(|e| Error::io(path, e))?;
    file.set_len(size).map_err(|e| Error::io(path, e))?;
    Ok(())
}
