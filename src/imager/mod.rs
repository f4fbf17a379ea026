//! Disk image creation.
//!
//! Image formats form a closed set. `raw` and `qcow2` share the partitioned
//! disk pipeline and differ only in how finished disks are emitted. `loop`
//! skips the partition table and builds one filesystem image per mountpoint.

pub mod bootloader;
pub mod descriptor;
pub mod disk;
pub mod fstab;
pub mod layout;
pub mod loop_image;
pub mod mountpoints;
pub mod raw;
pub mod stage;
pub mod tools;

use anyhow::{bail, Result};
use std::fmt;
use std::path::PathBuf;

use crate::archive::{self, Compression};
use crate::kickstart::Kickstart;
use crate::mount::Mounter;

pub use disk::DiskDescriptor;
pub use loop_image::LoopBuilder;
pub use raw::RawBuilder;
pub use tools::{DiskTools, SystemTools};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFormat {
    #[default]
    Raw,
    Qcow2,
    Loop,
}

impl ImageFormat {
    pub const ALL: &'static [ImageFormat] =
        &[ImageFormat::Raw, ImageFormat::Qcow2, ImageFormat::Loop];

    pub fn from_name(name: &str) -> Result<Self> {
        match Self::ALL.iter().find(|f| f.name() == name) {
            Some(format) => Ok(*format),
            None => bail!("Unknown image format '{}' (expected raw, qcow2 or loop)", name),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Loop => "loop",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Loop => "img",
            other => other.name(),
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Everything a build needs besides the kickstart.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Image name; files are `<name>-<disk>.<ext>`.
    pub name: String,
    pub format: ImageFormat,
    pub outdir: PathBuf,
    /// Parent of the scratch area.
    pub tmpdir: PathBuf,
    pub generate_bmap: bool,
    pub checksum: bool,
    pub compress: Option<Compression>,
    /// Tarball name in `outdir` to pack every finished file into.
    pub pack_to: Option<String>,
    /// Prepared tree copied into the install root.
    pub rootfs: Option<PathBuf>,
    /// Open a shell in the install root before finalising.
    pub shell: bool,
    pub arch: String,
    pub vcpu: u32,
    pub vmem_mb: u64,
}

/// Files a successful build left in the output directory.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub images: Vec<PathBuf>,
    pub descriptor: PathBuf,
    /// Mountpoint map of a loop build.
    pub mountpoints: Option<PathBuf>,
}

/// Build `ks` into images under `opts.outdir`.
pub fn create(
    ks: &Kickstart,
    opts: &CreateOptions,
    tools: &dyn DiskTools,
    mounter: &dyn Mounter,
) -> Result<BuildReport> {
    if let Some(pack_to) = &opts.pack_to {
        if pack_to.contains('/') {
            bail!("--pack-to takes a file name, not a path: {}", pack_to);
        }
        archive::tarball_kind(pack_to)?;
    }
    match opts.format {
        ImageFormat::Raw | ImageFormat::Qcow2 => RawBuilder::new(ks, opts, tools, mounter)?.build(),
        ImageFormat::Loop => LoopBuilder::new(ks, opts, tools, mounter)?.build(),
    }
}
