//! Chroot into a disk image file.

use anyhow::Result;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use super::ChrootOptions;
use crate::common::temp::ScratchDir;
use crate::error::Error;
use crate::gpt::{self, GptParser};
use crate::imager::layout::partition_device;
use crate::imager::raw::BuildStep;
use crate::imager::tools::DiskTools;
use crate::mount::Mounter;
use crate::teardown::Teardown;

/// Partition node to mount for `image` attached as `device`.
///
/// A GPT image is entered through its `root` partition, else its largest
/// one. Other images use partition 1 when the kernel created it, else the
/// whole device.
pub fn root_device(image: &Path, device: &str) -> String {
    let entries = match read_entries(image) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("{} has no usable GPT: {}", image.display(), e);
            Vec::new()
        }
    };

    if let Some(entry) = gpt::select_root_partition(&entries) {
        info!("entering partition '{}' (slot {})", entry.name, entry.index + 1);
        return partition_device(device, entry.index + 1);
    }
    let first = partition_device(device, 1);
    if Path::new(&first).exists() {
        first
    } else {
        device.to_string()
    }
}

fn read_entries(image: &Path) -> crate::error::Result<Vec<gpt::GptEntry>> {
    let parser = GptParser::open(image)?;
    let entries = parser.get_partitions(true)?.collect::<crate::error::Result<Vec<_>>>()?;
    Ok(entries)
}

/// Attach `image`, mount its root partition on a scratch directory, run the
/// chroot session there and release everything again.
pub fn run_in_image(
    image: &Path,
    opts: &ChrootOptions,
    tools: &dyn DiskTools,
    mounter: &dyn Mounter,
    tmpdir: &Path,
) -> Result<i32> {
    let name = format!("imgcraft-chroot-{}", std::process::id());
    let mut scratch = ScratchDir::create(tmpdir, &name)?;
    let mut teardown: Teardown<BuildStep> = Teardown::new();

    let result = mount_and_run(image, opts, tools, mounter, scratch.path(), &mut teardown);

    let failures = teardown.run(|step| match step {
        BuildStep::Unmount(target) => mounter.unmount(target, false).map_err(Into::into),
        BuildStep::Detach(device) => tools.detach_loop(device),
    });
    if !failures.is_empty() {
        warn!("{} release step(s) failed for {}", failures.len(), image.display());
        scratch.keep();
    }
    result
}

fn mount_and_run(
    image: &Path,
    opts: &ChrootOptions,
    tools: &dyn DiskTools,
    mounter: &dyn Mounter,
    scratch: &Path,
    teardown: &mut Teardown<BuildStep>,
) -> Result<i32> {
    let device = tools.attach_loop(image)?;
    teardown.push(BuildStep::Detach(device.clone()));

    let partdev = root_device(image, &device);
    let root: PathBuf = scratch.join("root");
    fs::create_dir_all(&root).map_err(|e| Error::io(&root, e))?;
    mounter.mount_device(Path::new(&partdev), &root, "auto", None)?;
    teardown.push(BuildStep::Unmount(root.clone()));
    println!("Mounted {} ({}) on {}", image.display(), partdev, root.display());

    super::run_in_chroot(&root, opts, mounter)
}
