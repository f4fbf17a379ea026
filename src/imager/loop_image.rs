//! Loop image builder: one filesystem image per mountpoint.
//!
//! No partition table is written. Each mountable partition becomes a sparse
//! file holding a bare filesystem, formatted on its own loop device and
//! mounted into the install root at its mountpoint. A mountpoint map next to
//! the images records which file belongs where.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use super::disk;
use super::fstab;
use super::mountpoints::{MountpointEntry, MountpointMap};
use super::raw::BuildStep;
use super::stage::{self, StagedDisk};
use super::tools::DiskTools;
use super::{BuildReport, CreateOptions};
use crate::chroot::{self, ChrootOptions};
use crate::common::temp::ScratchDir;
use crate::error::Error;
use crate::kickstart::{Kickstart, PartitionSpec};
use crate::mount::Mounter;
use crate::teardown::Teardown;
use crate::timing::Timer;

/// Size of an image whose partition gives none.
pub const DEFAULT_IMAGE_SIZE: u64 = 4096 * 1024 * 1024;

pub const DEFAULT_FSTYPE: &str = "ext3";

const LOOP_FSTYPES: &[&str] = &["ext2", "ext3", "ext4", "btrfs", "vfat", "msdos"];

/// A planned filesystem image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopImage {
    /// Image file name.
    pub file: String,
    /// Partition spec with label, size and fstype filled in.
    pub spec: PartitionSpec,
}

impl LoopImage {
    pub fn label(&self) -> &str {
        self.spec.label.as_deref().unwrap_or_default()
    }

    fn entry(&self) -> MountpointEntry {
        MountpointEntry {
            mountpoint: self.spec.mountpoint.clone(),
            label: self.label().to_string(),
            name: self.file.clone(),
            size: self.spec.size,
            fstype: self.spec.fstype.clone().unwrap_or_default(),
        }
    }
}

/// Label of a loop image: the partition's own, else the image name for the
/// root, else the mountpoint's last component.
fn label_for(spec: &PartitionSpec, mountpoint: &str, image_name: &str) -> String {
    if let Some(label) = spec.label.as_deref().filter(|l| !l.is_empty()) {
        return label.to_string();
    }
    if mountpoint == "/" {
        return image_name.to_string();
    }
    warn!("no label for the loop image of {}, naming it after the mountpoint", mountpoint);
    mountpoint.rsplit('/').next().unwrap_or_default().to_string()
}

/// Plan the images for `specs`, sorted by mountpoint so parents mount before
/// children. Swap and unmountable partitions are skipped.
pub fn plan_images(specs: &[PartitionSpec], image_name: &str) -> Result<Vec<LoopImage>> {
    let mut specs: Vec<&PartitionSpec> = specs
        .iter()
        .filter(|s| !s.is_swap() && s.mountpoint.starts_with('/'))
        .collect();
    specs.sort_by(|a, b| a.mountpoint.cmp(&b.mountpoint));

    let mut images: Vec<LoopImage> = Vec::with_capacity(specs.len());
    for spec in specs {
        let mountpoint = match spec.mountpoint.as_str() {
            "/" => "/",
            other => other.trim_end_matches('/'),
        };
        let fstype = spec
            .fstype
            .clone()
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| DEFAULT_FSTYPE.to_string());
        if !LOOP_FSTYPES.contains(&fstype.as_str()) {
            return Err(Error::Build(format!(
                "cannot build a loop image of {} for {}",
                fstype, mountpoint
            ))
            .into());
        }

        let label = label_for(spec, mountpoint, image_name);
        let file = format!("{}.img", label.strip_suffix(".img").unwrap_or(&label));
        if let Some(clash) = images.iter().find(|i| i.file == file) {
            return Err(Error::Build(format!(
                "{} and {} would both be written to {}, give one a --label",
                clash.spec.mountpoint, mountpoint, file
            ))
            .into());
        }

        let mut spec = spec.clone();
        spec.mountpoint = mountpoint.to_string();
        spec.fstype = Some(fstype);
        spec.label = Some(label);
        if spec.size == 0 {
            spec.size = DEFAULT_IMAGE_SIZE;
        }
        images.push(LoopImage { file, spec });
    }

    if images.is_empty() {
        return Err(Error::Build("no mountable partitions to build loop images from".into()).into());
    }
    Ok(images)
}

pub struct LoopBuilder<'a> {
    ks: &'a Kickstart,
    opts: &'a CreateOptions,
    tools: &'a dyn DiskTools,
    mounter: &'a dyn Mounter,
    images: Vec<LoopImage>,
    teardown: Teardown<BuildStep>,
}

impl<'a> LoopBuilder<'a> {
    /// Plan the images. Fails before touching the host.
    pub fn new(
        ks: &'a Kickstart,
        opts: &'a CreateOptions,
        tools: &'a dyn DiskTools,
        mounter: &'a dyn Mounter,
    ) -> Result<Self> {
        let images = plan_images(&ks.partitions, &opts.name)?;
        Ok(Self {
            ks,
            opts,
            tools,
            mounter,
            images,
            teardown: Teardown::new(),
        })
    }

    pub fn build(mut self) -> Result<BuildReport> {
        let scratch_name = format!("imgcraft-{}-{}", self.opts.name, std::process::id());
        let mut scratch = ScratchDir::create(&self.opts.tmpdir, &scratch_name)?;

        let assembled = self.assemble(scratch.path());
        let failures = self.release();
        if !failures.is_empty() {
            scratch.keep();
        }
        let files = assembled?;
        if let Some(first) = failures.into_iter().next() {
            return Err(first.context("releasing build devices failed"));
        }

        self.finalize(scratch.path(), files)
    }

    /// Create, format and mount every image, then populate the tree.
    fn assemble(&mut self, scratch: &Path) -> Result<Vec<PathBuf>> {
        let timer = Timer::start("Loop images");
        let install_root = scratch.join("install_root");
        let mut files = Vec::with_capacity(self.images.len());

        for image in &self.images {
            let file = scratch.join(&image.file);
            disk::create_sparse(&file, image.spec.size)?;
            files.push(file.clone());
            let device = self.tools.attach_loop(&file)?;
            self.teardown.push(BuildStep::Detach(device.clone()));
            println!("  {} -> {} ({} MiB)", image.file, device, image.spec.size >> 20);

            self.tools.format(&device, &image.spec).map_err(|e| {
                Error::Build(format!(
                    "formatting {} ({}) failed: {:#}",
                    image.spec.mountpoint, device, e
                ))
            })?;

            let target = install_root.join(image.spec.mountpoint.trim_start_matches('/'));
            fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))?;
            debug!("mounting {} on {}", image.file, target.display());
            self.mounter.mount_device(
                Path::new(&device),
                &target,
                image.spec.fstype.as_deref().unwrap_or(DEFAULT_FSTYPE),
                image.spec.fsopts.as_deref(),
            )?;
            self.teardown.push(BuildStep::Unmount(target));
        }
        timer.finish();

        if let Some(rootfs) = &self.opts.rootfs {
            let timer = Timer::start("Populate root");
            self.tools
                .copy_tree(rootfs, &install_root)
                .with_context(|| format!("Populating from {} failed", rootfs.display()))?;
            timer.finish();
        }
        let entries: Vec<fstab::Entry> = self
            .images
            .iter()
            .map(|i| fstab::Entry::labelled(i.label(), &i.spec))
            .collect();
        fstab::write(&install_root, &entries)?;

        if self.opts.shell {
            println!("Opening a shell in {} (exit to continue)", install_root.display());
            let code = chroot::run_in_chroot(&install_root, &ChrootOptions::default(), self.mounter)?;
            debug!("shell exited with {}", code);
        }

        Ok(files)
    }

    /// Unmount every image and detach its loop device, newest first.
    fn release(&mut self) -> Vec<anyhow::Error> {
        let tools = self.tools;
        let mounter = self.mounter;
        self.teardown.run(|step| match step {
            BuildStep::Unmount(target) => mounter.unmount(target, false).map_err(Into::into),
            BuildStep::Detach(device) => tools.detach_loop(device),
        })
    }

    fn finalize(&self, scratch: &Path, files: Vec<PathBuf>) -> Result<BuildReport> {
        let timer = Timer::start("Finalize");
        let mut staged = Vec::new();

        for (image, file) in self.images.iter().zip(files) {
            if image.spec.exclude_from_image {
                info!("{} is excluded from the image", image.file);
                continue;
            }
            self.tools.resparse(&file)?;
            let (file, checksums) = stage::seal(file, self.opts)?;
            staged.push(StagedDisk {
                disk: image.label().to_string(),
                image: file,
                bmap: None,
                checksums,
            });
        }

        let mut report = stage::deliver(self.opts, scratch, &staged, self.ks.network_count)?;

        let map = MountpointMap {
            arch: self.opts.arch.clone(),
            images: self.images.iter().map(LoopImage::entry).collect(),
        };
        let path = self.opts.outdir.join(MountpointMap::file_name(
            &self.opts.name,
            self.opts.pack_to.as_deref(),
        )?);
        map.save(&path)?;
        report.mountpoints = Some(path);

        timer.finish();
        Ok(report)
    }
}

impl Drop for LoopBuilder<'_> {
    fn drop(&mut self) {
        for e in self.release() {
            warn!("{:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(mountpoint: &str, fstype: &str) -> PartitionSpec {
        PartitionSpec::new(mountpoint, 16, "sda", fstype)
    }

    #[test]
    fn test_images_sorted_and_named() {
        let mut boot = spec("/boot", "ext4");
        boot.label = Some("bootfs.img".to_string());
        let specs = vec![
            spec("/var/", "ext4"),
            spec("swap", "swap"),
            boot,
            spec("/", "ext4"),
        ];

        let images = plan_images(&specs, "mini").unwrap();
        let files: Vec<&str> = images.iter().map(|i| i.file.as_str()).collect();
        assert_eq!(files, vec!["mini.img", "bootfs.img", "var.img"]);
        assert_eq!(images[0].label(), "mini");
        assert_eq!(images[2].spec.mountpoint, "/var");
        assert_eq!(images[2].label(), "var");
    }

    #[test]
    fn test_defaults_filled_in() {
        let mut root = spec("/", "");
        root.fstype = None;
        root.size = 0;

        let images = plan_images(&[root], "mini").unwrap();
        assert_eq!(images[0].spec.fstype.as_deref(), Some(DEFAULT_FSTYPE));
        assert_eq!(images[0].spec.size, DEFAULT_IMAGE_SIZE);
    }

    #[test]
    fn test_clashing_files_rejected() {
        let mut home = spec("/home", "ext4");
        home.label = Some("data".to_string());
        let mut srv = spec("/srv", "ext4");
        srv.label = Some("data.img".to_string());

        let err = plan_images(&[home, srv], "mini").unwrap_err();
        assert!(err.to_string().contains("data.img"));
    }

    #[test]
    fn test_unsupported_fstype_rejected() {
        let err = plan_images(&[spec("/", "xfs")], "mini").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Build(_))));
    }

    #[test]
    fn test_swap_only_rejected() {
        assert!(plan_images(&[spec("swap", "swap")], "mini").is_err());
    }
}
