//! Show command - displays information.

use anyhow::Result;
use std::path::Path;

use imgcraft::bootstrap;
use imgcraft::chroot::arch;
use imgcraft::config::Config;
use imgcraft::imager::descriptor::ImageDescriptor;
use imgcraft::imager::mountpoints::MountpointMap;

pub enum ShowTarget {
    Config,
    /// Print a build descriptor.
    Descriptor(std::path::PathBuf),
    Mountpoints(std::path::PathBuf),
}

pub fn cmd_show(target: ShowTarget, config: &Config) -> Result<()> {
    match target {
        ShowTarget::Config => {
            config.print();
            println!();
            match arch::host_arch() {
                Ok(host) => println!("Host architecture: {}", host),
                Err(e) => println!("Host architecture: unknown ({})", e),
            }
            println!(
                "Inside bootstrap root: {}",
                if bootstrap::in_bootstrap() { "yes" } else { "no" }
            );
        }
        ShowTarget::Descriptor(path) => print_descriptor(&path)?,
        ShowTarget::Mountpoints(path) => print_mountpoints(&path)?,
    }
    Ok(())
}

fn print_descriptor(path: &Path) -> Result<()> {
    let desc = ImageDescriptor::read(path)?;
    println!("Image: {} ({})", desc.name, desc.arch);
    println!("  vcpu: {}  memory: {} KiB  interfaces: {}", desc.vcpu, desc.memory_kib, desc.interfaces);
    if let Some(archive) = &desc.archive {
        println!("  packed in: {}", archive);
    }
    for disk in &desc.disks {
        println!("  {} [{}] {} ({})", disk.target, disk.disk, disk.file, disk.format);
        if let Some(bmap) = &disk.bmap {
            println!("      bmap: {}", bmap);
        }
        if let Some(sums) = &disk.checksums {
            println!("      sha256: {}", sums.sha256);
        }
    }
    Ok(())
}

fn print_mountpoints(path: &Path) -> Result<()> {
    let map = MountpointMap::load(path)?;
    println!("Loop images ({})", map.arch);
    for entry in &map.images {
        println!(
            "  {:<12} {} [{}] {} {} MiB",
            entry.mountpoint,
            entry.name,
            entry.label,
            entry.fstype,
            entry.size >> 20
        );
    }
    Ok(())
}
