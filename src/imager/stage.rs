//! Delivery of finished disks into the output directory.
//!
//! Disks are sealed (checksummed, then compressed) inside the scratch area.
//! Delivery either moves every file into the output directory or packs them
//! into one tarball there, then writes the build descriptor.

use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

use super::descriptor::{drive_target, Checksums, DiskEntry, ImageDescriptor};
use super::{BuildReport, CreateOptions};
use crate::archive;
use crate::checksum::{self, HashAlgo};
use crate::error::Error;

/// A disk image on its way to the output directory.
#[derive(Debug)]
pub struct StagedDisk {
    pub disk: String,
    pub image: PathBuf,
    pub bmap: Option<PathBuf>,
    pub checksums: Option<Checksums>,
}

impl StagedDisk {
    fn files(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.image).chain(self.bmap.as_ref())
    }
}

/// Checksum `image` if asked, then compress it if asked. Checksums cover the
/// uncompressed file.
pub fn seal(image: PathBuf, opts: &CreateOptions) -> Result<(PathBuf, Option<Checksums>)> {
    let checksums = if opts.checksum {
        Some(Checksums {
            sha256: checksum::file_digest(&image, None, HashAlgo::Sha256)?,
            sha512: checksum::file_digest(&image, None, HashAlgo::Sha512)?,
        })
    } else {
        None
    };

    let image = match opts.compress {
        Some(compression) => archive::compress(&image, compression)?,
        None => image,
    };
    Ok((image, checksums))
}

/// Move or pack `staged` into the output directory and write the descriptor.
pub fn deliver(
    opts: &CreateOptions,
    scratch: &Path,
    staged: &[StagedDisk],
    interfaces: u32,
) -> Result<BuildReport> {
    let mut report = BuildReport::default();
    fs::create_dir_all(&opts.outdir).map_err(|e| Error::io(&opts.outdir, e))?;

    match &opts.pack_to {
        Some(pack_to) => {
            let tarball = opts.outdir.join(pack_to);
            let members: Vec<String> =
                staged.iter().flat_map(|d| d.files()).map(|p| file_name(p)).collect();
            info!("packing {} file(s) into {}", members.len(), tarball.display());
            if let Err(e) = archive::pack(&tarball, scratch, &members) {
                let _ = fs::remove_file(&tarball);
                return Err(e);
            }
            report.images.push(tarball);
        }
        None => {
            if let Err(e) = move_outputs(opts, staged, &mut report) {
                for path in &report.images {
                    let _ = fs::remove_file(path);
                }
                return Err(e);
            }
        }
    }

    report.descriptor = descriptor(opts, staged, interfaces).write(&opts.outdir)?;
    Ok(report)
}

fn move_outputs(opts: &CreateOptions, staged: &[StagedDisk], report: &mut BuildReport) -> Result<()> {
    for src in staged.iter().flat_map(|d| d.files()) {
        let dest = opts.outdir.join(file_name(src));
        move_file(src, &dest)?;
        report.images.push(dest);
    }
    Ok(())
}

fn descriptor(opts: &CreateOptions, staged: &[StagedDisk], interfaces: u32) -> ImageDescriptor {
    let disks = staged
        .iter()
        .enumerate()
        .map(|(i, d)| DiskEntry {
            disk: d.disk.clone(),
            target: drive_target(i),
            file: file_name(&d.image),
            format: opts.format.to_string(),
            bmap: d.bmap.as_deref().map(file_name),
            checksums: d.checksums.clone(),
        })
        .collect();
    ImageDescriptor {
        name: opts.name.clone(),
        arch: opts.arch.clone(),
        vcpu: opts.vcpu,
        memory_kib: opts.vmem_mb * 1024,
        interfaces,
        archive: opts.pack_to.clone(),
        disks,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Rename, falling back to copy and delete across filesystems.
fn move_file(src: &Path, dest: &Path) -> Result<()> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    fs::copy(src, dest)
        .with_context(|| format!("Failed to move {} to {}", src.display(), dest.display()))?;
    fs::remove_file(src).map_err(|e| Error::io(src, e))?;
    Ok(())
}
