//! Raw disk image builder.
//!
//! Every loop attach and every mount pushes its release onto one teardown
//! list. The list runs before any output is staged, so a failed build never
//! leaves a device attached or a half-written image in the output
//! directory.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use super::bootloader;
use super::disk::{self, DiskDescriptor};
use super::fstab;
use super::layout::{self, DiskLayout};
use super::stage::{self, StagedDisk};
use super::tools::DiskTools;
use super::{BuildReport, CreateOptions, ImageFormat};
use crate::bmap;
use crate::chroot::{self, ChrootOptions};
use crate::common::temp::ScratchDir;
use crate::error::Error;
use crate::kickstart::Kickstart;
use crate::mount::Mounter;
use crate::teardown::Teardown;
use crate::timing::Timer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStep {
    Detach(String),
    Unmount(PathBuf),
}

pub struct RawBuilder<'a> {
    ks: &'a Kickstart,
    opts: &'a CreateOptions,
    tools: &'a dyn DiskTools,
    mounter: &'a dyn Mounter,
    disks: Vec<DiskDescriptor>,
    layouts: Vec<DiskLayout>,
    teardown: Teardown<BuildStep>,
}

impl<'a> RawBuilder<'a> {
    /// Validate the partition specs. Fails before touching the host.
    pub fn new(
        ks: &'a Kickstart,
        opts: &'a CreateOptions,
        tools: &'a dyn DiskTools,
        mounter: &'a dyn Mounter,
    ) -> Result<Self> {
        let disks = disk::plan_disks(&ks.partitions)?;
        let layouts = disks
            .iter()
            .map(|d| layout::plan_layout(d, ks.bootloader.ptable))
            .collect();
        Ok(Self {
            ks,
            opts,
            tools,
            mounter,
            disks,
            layouts,
            teardown: Teardown::new(),
        })
    }

    /// Build every disk and stage the results into the output directory.
    pub fn build(mut self) -> Result<BuildReport> {
        let scratch_name = format!("imgcraft-{}-{}", self.opts.name, std::process::id());
        let mut scratch = ScratchDir::create(&self.opts.tmpdir, &scratch_name)?;

        let assembled = self.assemble(scratch.path());
        let failures = self.release();
        if !failures.is_empty() {
            scratch.keep();
        }
        let images = assembled?;
        if let Some(first) = failures.into_iter().next() {
            return Err(first.context("releasing build devices failed"));
        }

        self.finalize(scratch.path(), images)
    }

    /// Attach, partition, format, mount and populate every disk. Returns the
    /// backing file of each disk, in disk order.
    fn assemble(&mut self, scratch: &Path) -> Result<Vec<PathBuf>> {
        let timer = Timer::start("Disk layout");
        let mut images = Vec::new();
        let mut devices: Vec<(String, String)> = Vec::new();

        for (disk, layout) in self.disks.iter_mut().zip(&self.layouts) {
            let image = scratch.join(disk::image_file_name(&self.opts.name, &disk.name));
            disk::create_sparse(&image, layout.file_size)?;
            let device = self.tools.attach_loop(&image)?;
            self.teardown.push(BuildStep::Detach(device.clone()));
            println!("  {} -> {} ({} MiB)", disk.name, device, layout.file_size >> 20);

            self.tools
                .partition(&device, layout)
                .with_context(|| format!("Partitioning {} failed", disk.name))?;
            for part in layout.partitions.iter().filter(|p| p.spec.boot) {
                self.tools
                    .set_flag(&device, part.num, bootloader::boot_flag(layout.table))
                    .map_err(|e| {
                        Error::Build(format!(
                            "cannot mark {} ({}{}) active: {:#}",
                            part.spec.mountpoint, device, part.num, e
                        ))
                    })?;
            }
            disk.image = Some(image.clone());
            disk.device = Some(device.clone());
            devices.push((disk.name.clone(), device));
            images.push(image);
        }

        for layout in &self.layouts {
            let device = device_of(&devices, &layout.disk)?;
            for part in &layout.partitions {
                let partdev = layout::partition_device(device, part.num);
                self.tools.format(&partdev, &part.spec).map_err(|e| {
                    Error::Build(format!(
                        "formatting {} ({}) failed: {:#}",
                        part.spec.mountpoint, partdev, e
                    ))
                })?;
            }
        }
        timer.finish();

        let install_root = scratch.join("install_root");
        let mounted = layout::mount_order(&self.layouts);
        for part in &mounted {
            let device = device_of(&devices, &part.disk)?;
            let partdev = layout::partition_device(device, part.num);
            let target = install_root.join(part.spec.mountpoint.trim_start_matches('/'));
            fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))?;
            self.mounter.mount_device(
                Path::new(&partdev),
                &target,
                part.spec.fstype.as_deref().unwrap_or("auto"),
                part.spec.fsopts.as_deref(),
            )?;
            self.teardown.push(BuildStep::Unmount(target));
        }

        if let Some(rootfs) = &self.opts.rootfs {
            let timer = Timer::start("Populate root");
            self.tools.copy_tree(rootfs, &install_root)?;
            timer.finish();
        }
        let entries: Vec<fstab::Entry> =
            mounted.iter().map(|p| fstab::Entry::partition(p)).collect();
        fstab::write(&install_root, &entries)?;

        if self.opts.shell {
            println!("Opening a shell in {} (exit to continue)", install_root.display());
            let code = chroot::run_in_chroot(&install_root, &ChrootOptions::default(), self.mounter)?;
            debug!("shell exited with {}", code);
        }

        if bootloader::applicable(&install_root) {
            bootloader::install(
                self.tools,
                &install_root,
                &self.layouts,
                &devices,
                &self.opts.name,
                &self.ks.bootloader,
            )?;
        } else {
            info!("no extlinux in the install root, bootloader not installed");
        }

        Ok(images)
    }

    /// Unmount everything and detach the loop devices, newest first.
    fn release(&mut self) -> Vec<anyhow::Error> {
        let tools = self.tools;
        let mounter = self.mounter;
        self.teardown.run(|step| match step {
            BuildStep::Unmount(target) => mounter.unmount(target, false).map_err(Into::into),
            BuildStep::Detach(device) => tools.detach_loop(device),
        })
    }

    fn finalize(&self, scratch: &Path, images: Vec<PathBuf>) -> Result<BuildReport> {
        let timer = Timer::start("Finalize");
        let mut staged = Vec::new();

        for (disk, image) in self.disks.iter().zip(images) {
            if disk.is_excluded() {
                info!("disk {} is excluded from the image", disk.name);
                continue;
            }
            self.tools.resparse(&image)?;

            let bmap = if self.opts.generate_bmap && self.opts.format == ImageFormat::Raw {
                let path = scratch.join(format!("{}-{}.bmap", self.opts.name, disk.name));
                bmap::write_bmap(&image, &path)?;
                Some(path)
            } else {
                None
            };

            let mut image = image;
            if self.opts.format == ImageFormat::Qcow2 {
                let qcow2 = image.with_extension(ImageFormat::Qcow2.extension());
                self.tools.convert_qcow2(&image, &qcow2)?;
                fs::remove_file(&image).map_err(|e| Error::io(&image, e))?;
                image = qcow2;
            }

            let (image, checksums) = stage::seal(image, self.opts)?;
            staged.push(StagedDisk {
                disk: disk.name.clone(),
                image,
                bmap,
                checksums,
            });
        }

        let report = stage::deliver(self.opts, scratch, &staged, self.ks.network_count)?;
        timer.finish();
        Ok(report)
    }
}

impl Drop for RawBuilder<'_> {
    fn drop(&mut self) {
        for e in self.release() {
            warn!("{:#}", e);
        }
    }
}

fn device_of<'d>(devices: &'d [(String, String)], disk: &str) -> Result<&'d str> {
    devices
        .iter()
        .find(|(name, _)| name == disk)
        .map(|(_, dev)| dev.as_str())
        .ok_or_else(|| Error::Build(format!("disk {} is not attached", disk)).into())
}
