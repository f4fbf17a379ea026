//! extlinux boot menu and first-stage install.

use anyhow::{Context, Result};
use log::{debug, info};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use super::layout::{self, DiskLayout};
use super::tools::DiskTools;
use crate::error::Error;
use crate::kickstart::{BootloaderSpec, PartitionTable};

/// The MBR boot code area.
pub const MBR_CODE_SIZE: usize = 440;

const SYSLINUX_DIR: &str = "usr/share/syslinux";
const EXTLINUX_DIR: &str = "boot/extlinux";

/// Whether the install root ships extlinux.
pub fn applicable(install_root: &Path) -> bool {
    install_root.join(SYSLINUX_DIR).is_dir() && install_root.join(EXTLINUX_DIR).is_dir()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelSet {
    /// `boot/vmlinuz` is a link to the given version.
    Linked(String),
    /// Versions found as `boot/vmlinuz-<version>`, sorted.
    Versions(Vec<String>),
}

pub fn find_kernels(install_root: &Path) -> Result<KernelSet> {
    let boot = install_root.join("boot");
    let link = boot.join("vmlinuz");
    if let Ok(target) = fs::read_link(&link) {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let version = name.strip_prefix("vmlinuz-").unwrap_or(&name).to_string();
        return Ok(KernelSet::Linked(version));
    }

    let mut versions = Vec::new();
    if boot.is_dir() {
        for entry in fs::read_dir(&boot).with_context(|| format!("Failed to read {}", boot.display()))? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(version) = name.strip_prefix("vmlinuz-") {
                versions.push(version.to_string());
            }
        }
    }
    versions.sort();
    Ok(KernelSet::Versions(versions))
}

/// Render `extlinux.conf`.
pub fn render_config(distro: &str, kernels: &KernelSet, rootdev: &str, append: &str) -> String {
    let mut conf = String::new();
    conf.push_str("prompt 0\ntimeout 1\n\ndefault vesamenu.c32\n");
    let _ = writeln!(conf, "menu autoboot Starting {}...", distro);
    conf.push_str("menu hidden\n\n");
    let _ = writeln!(conf, "menu title Welcome to {}!", distro);

    let label = distro.to_lowercase();
    let append = format!("ro root={} {}", rootdev, append);
    let append = append.trim_end();

    match kernels {
        KernelSet::Linked(version) => {
            let _ = writeln!(conf, "label {}", label);
            let _ = writeln!(conf, "\tmenu label {} ({})", distro, version);
            conf.push_str("\tlinux /vmlinuz\n");
            let _ = writeln!(conf, "\tappend {}", append);
            conf.push_str("\tmenu default\n");
        }
        KernelSet::Versions(versions) => {
            for (n, version) in versions.iter().enumerate() {
                let _ = writeln!(conf, "label {}{}", label, n);
                let _ = writeln!(conf, "\tmenu label {} ({})", distro, version);
                let _ = writeln!(conf, "\tlinux vmlinuz-{}", version);
                let _ = writeln!(conf, "\tappend {}", append);
                if n == 0 {
                    conf.push_str("\tmenu default\n");
                }
            }
        }
    }
    conf
}

/// Device name of the root filesystem as the booted system sees it.
pub fn root_device(layouts: &[DiskLayout]) -> Option<String> {
    layouts
        .iter()
        .flat_map(|l| l.partitions.iter())
        .find(|p| p.spec.mountpoint == "/")
        .map(|p| format!("/dev/{}{}", p.disk, p.num))
}

fn mbr_image(table: PartitionTable) -> &'static str {
    match table {
        PartitionTable::Msdos => "mbr.bin",
        PartitionTable::Gpt => "gptmbr.bin",
    }
}

/// Partition flag that marks a partition bootable under `table`.
pub fn boot_flag(table: PartitionTable) -> &'static str {
    match table {
        PartitionTable::Msdos => "boot",
        PartitionTable::Gpt => "legacy_boot",
    }
}

/// Write the menu, copy the kernels next to it and install extlinux onto
/// the disk holding the boot partition.
pub fn install(
    tools: &dyn DiskTools,
    install_root: &Path,
    layouts: &[DiskLayout],
    devices: &[(String, String)],
    distro: &str,
    spec: &BootloaderSpec,
) -> Result<()> {
    let boot = layout::boot_partition(layouts)
        .ok_or_else(|| Error::Build("no / or /boot partition to boot from".to_string()))?;
    let device = devices
        .iter()
        .find(|(disk, _)| *disk == boot.disk)
        .map(|(_, dev)| dev.as_str())
        .ok_or_else(|| Error::Build(format!("disk {} is not attached", boot.disk)))?;
    let rootdev = root_device(layouts).unwrap_or_default();

    let extlinux_dir = install_root.join(EXTLINUX_DIR);
    let kernels = find_kernels(install_root)?;
    if let KernelSet::Versions(versions) = &kernels {
        for version in versions {
            let name = format!("vmlinuz-{}", version);
            fs::copy(install_root.join("boot").join(&name), extlinux_dir.join(&name))
                .with_context(|| format!("Failed to copy kernel {}", name))?;
        }
    }
    let conf = render_config(distro, &kernels, &rootdev, &spec.append);
    debug!("writing {}/extlinux.conf", extlinux_dir.display());
    fs::write(extlinux_dir.join("extlinux.conf"), conf)?;

    let table = layouts
        .iter()
        .find(|l| l.disk == boot.disk)
        .map(|l| l.table)
        .unwrap_or_default();
    let mbr_path: PathBuf = install_root.join(SYSLINUX_DIR).join(mbr_image(table));
    let mbr = fs::read(&mbr_path).map_err(|e| Error::io(&mbr_path, e))?;
    if mbr.len() > MBR_CODE_SIZE {
        return Err(Error::Build(format!(
            "{} is {} bytes, larger than the {}-byte boot code area",
            mbr_path.display(),
            mbr.len(),
            MBR_CODE_SIZE
        ))
        .into());
    }
    let written = tools.write_raw(device, &mbr)?;
    if written != mbr.len() {
        return Err(Error::Build(format!(
            "short MBR write to {}: {} of {} bytes",
            device,
            written,
            mbr.len()
        ))
        .into());
    }

    tools
        .set_flag(device, boot.num, boot_flag(table))
        .map_err(|e| Error::Build(format!("cannot mark partition {} bootable: {:#}", boot.num, e)))?;

    tools.sync();
    tools
        .install_extlinux(&extlinux_dir)
        .map_err(|e| Error::Build(format!("{:#}", e)))?;
    info!("extlinux installed on {}", device);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_menu_for_versions() {
        let kernels = KernelSet::Versions(vec!["6.1.0".to_string(), "6.6.2".to_string()]);
        let conf = render_config("Tizen", &kernels, "/dev/sda1", "quiet");
        assert!(conf.starts_with("prompt 0\ntimeout 1\n\ndefault vesamenu.c32\n"));
        assert!(conf.contains("label tizen0\n\tmenu label Tizen (6.1.0)\n\tlinux vmlinuz-6.1.0\n\tappend ro root=/dev/sda1 quiet\n\tmenu default\n"));
        assert!(conf.contains("label tizen1\n"));
        assert_eq!(conf.matches("menu default").count(), 1);
    }

    #[test]
    fn test_linked_kernel() {
        let dir = tempfile::tempdir().unwrap();
        let boot = dir.path().join("boot");
        fs::create_dir_all(&boot).unwrap();
        fs::write(boot.join("vmlinuz-5.10.0"), "").unwrap();
        std::os::unix::fs::symlink("vmlinuz-5.10.0", boot.join("vmlinuz")).unwrap();

        let kernels = find_kernels(dir.path()).unwrap();
        assert_eq!(kernels, KernelSet::Linked("5.10.0".to_string()));
        let conf = render_config("Img", &kernels, "/dev/sda1", "");
        assert!(conf.contains("\tlinux /vmlinuz\n\tappend ro root=/dev/sda1\n"));
    }

    #[test]
    fn test_found_versions_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let boot = dir.path().join("boot");
        fs::create_dir_all(&boot).unwrap();
        fs::write(boot.join("vmlinuz-6.6"), "").unwrap();
        fs::write(boot.join("vmlinuz-6.1"), "").unwrap();
        fs::write(boot.join("config-6.1"), "").unwrap();
        assert_eq!(
            find_kernels(dir.path()).unwrap(),
            KernelSet::Versions(vec!["6.1".to_string(), "6.6".to_string()])
        );
    }
}
