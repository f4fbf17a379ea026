//! Host tools that touch block devices.
//!
//! The builder only talks to [`DiskTools`]; [`SystemTools`] is the real
//! implementation on top of parted, losetup, the mkfs family and friends.

use anyhow::{bail, Context, Result};
use log::debug;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use super::layout::DiskLayout;
use crate::kickstart::{PartitionSpec, PartitionTable};
use crate::process::{self, Cmd};

/// Filesystem block size used for ext filesystems.
const EXT_BLOCK_SIZE: u32 = 4096;

pub trait DiskTools {
    /// Attach `image` to a free loop device with partition scanning.
    fn attach_loop(&self, image: &Path) -> Result<String>;
    fn detach_loop(&self, device: &str) -> Result<()>;
    /// Write the partition table described by `layout`.
    fn partition(&self, device: &str, layout: &DiskLayout) -> Result<()>;
    /// Create `spec`'s filesystem on `device`.
    fn format(&self, device: &str, spec: &PartitionSpec) -> Result<()>;
    fn set_flag(&self, device: &str, num: u32, flag: &str) -> Result<()>;
    /// Write `data` at offset 0 of `device`. Returns bytes written.
    fn write_raw(&self, device: &str, data: &[u8]) -> Result<usize>;
    fn sync(&self);
    fn install_extlinux(&self, dir: &Path) -> Result<()>;
    /// Punch holes over zeroed regions of `image`.
    fn resparse(&self, image: &Path) -> Result<()>;
    /// Copy a prepared tree into the install root, preserving everything.
    fn copy_tree(&self, src: &Path, dest: &Path) -> Result<()>;
    fn convert_qcow2(&self, raw: &Path, qcow2: &Path) -> Result<()>;
}

pub struct SystemTools;

/// Filesystem type name as parted understands it.
fn parted_fs_type(fstype: &str) -> &str {
    match fstype {
        "swap" => "linux-swap",
        "vfat" | "msdos" => "fat32",
        other => other,
    }
}

/// `parted` arguments creating each partition of `layout`.
pub fn parted_commands(layout: &DiskLayout) -> Vec<Vec<String>> {
    let mut cmds = vec![vec!["mklabel".to_string(), layout.table.to_string()]];
    for part in &layout.partitions {
        let name = match layout.table {
            PartitionTable::Msdos => "primary".to_string(),
            PartitionTable::Gpt => label_for(&part.spec),
        };
        let fstype = part.spec.fstype.as_deref().unwrap_or("ext4");
        cmds.push(vec![
            "unit".to_string(),
            "s".to_string(),
            "mkpart".to_string(),
            if name.is_empty() { "root".to_string() } else { name },
            parted_fs_type(fstype).to_string(),
            part.start_sector.to_string(),
            part.end_sector.to_string(),
        ]);
    }
    cmds
}

/// Filesystem label: the explicit one, else the mountpoint without slashes.
pub fn label_for(spec: &PartitionSpec) -> String {
    spec.label
        .as_deref()
        .unwrap_or(&spec.mountpoint)
        .replace('/', "")
}

/// Formatter invocation for `spec` on `device`.
pub fn mkfs_command(device: &str, spec: &PartitionSpec) -> Result<Cmd> {
    let fstype = spec.fstype.as_deref().unwrap_or_default();
    let label = label_for(spec);
    let uuid = spec
        .uuid
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let cmd = match fstype {
        "ext2" | "ext3" | "ext4" => {
            let mut cmd = Cmd::new(format!("mkfs.{}", fstype)).arg("-F");
            if !label.is_empty() {
                cmd = cmd.args(["-L", &label]);
            }
            cmd = cmd
                .args(["-m", "1", "-b", &EXT_BLOCK_SIZE.to_string(), "-U", &uuid]);
            if let Some(extopts) = &spec.extopts {
                cmd = cmd.args(extopts.split_whitespace());
            }
            cmd.arg(device)
        }
        "vfat" | "msdos" => {
            let serial: String = uuid.chars().filter(char::is_ascii_hexdigit).take(8).collect();
            let mut cmd = Cmd::new("mkfs.vfat");
            if !label.is_empty() {
                cmd = cmd.args(["-n", &label]);
            }
            cmd.args(["-i", &serial]).arg(device)
        }
        "btrfs" => {
            let mut cmd = Cmd::new("mkfs.btrfs").arg("-f");
            if !label.is_empty() {
                cmd = cmd.args(["-L", &label]);
            }
            cmd.arg(device)
        }
        "swap" => Cmd::new("mkswap").args(["-U", &uuid]).arg(device),
        other => bail!("unsupported filesystem type '{}'", other),
    };
    Ok(cmd.error_msg(format!("Error creating {} filesystem on {}", fstype, device)))
}

impl DiskTools for SystemTools {
    fn attach_loop(&self, image: &Path) -> Result<String> {
        let result = Cmd::new("losetup")
            .args(["-f", "-P", "--show"])
            .arg_path(image)
            .error_msg(format!("Failed to attach {} to a loop device", image.display()))
            .run()?;
        let device = result.stdout_trimmed().to_string();
        if device.is_empty() {
            bail!("losetup printed no device for {}", image.display());
        }
        Ok(device)
    }

    fn detach_loop(&self, device: &str) -> Result<()> {
        Cmd::new("losetup")
            .args(["-d", device])
            .error_msg(format!("Failed to detach {}", device))
            .run()?;
        Ok(())
    }

    fn partition(&self, device: &str, layout: &DiskLayout) -> Result<()> {
        for args in parted_commands(layout) {
            Cmd::new("parted")
                .args(["-s", device])
                .args(&args)
                .error_msg(format!("parted {} failed on {}", args.join(" "), device))
                .run()?;
        }
        // Make sure the kernel sees the new partition nodes
        Cmd::new("partprobe").arg(device).allow_fail().run()?;
        Ok(())
    }

    fn format(&self, device: &str, spec: &PartitionSpec) -> Result<()> {
        mkfs_command(device, spec)?.run()?;
        let is_ext = matches!(spec.fstype.as_deref(), Some("ext2" | "ext3" | "ext4"));
        if is_ext && spec.extopts.is_none() {
            debug!("tuning filesystem on {}", device);
            Cmd::new("tune2fs")
                .args(["-c0", "-i0", "-Odir_index", "-ouser_xattr,acl", device])
                .allow_fail()
                .run()?;
        }
        Ok(())
    }

    fn set_flag(&self, device: &str, num: u32, flag: &str) -> Result<()> {
        Cmd::new("parted")
            .args(["-s", device, "set", &num.to_string(), flag, "on"])
            .error_msg(format!("Failed to set {} flag on {} partition {}", flag, device, num))
            .run()?;
        Ok(())
    }

    fn write_raw(&self, device: &str, data: &[u8]) -> Result<usize> {
        let mut dev = OpenOptions::new()
            .write(true)
            .open(device)
            .with_context(|| format!("Failed to open {}", device))?;
        let written = dev
            .write(data)
            .with_context(|| format!("Failed to write {}", device))?;
        dev.flush()?;
        Ok(written)
    }

    fn sync(&self) {
        process::sync();
    }

    fn install_extlinux(&self, dir: &Path) -> Result<()> {
        Cmd::new("extlinux")
            .arg("-i")
            .arg_path(dir)
            .error_msg("extlinux installation failed")
            .run()?;
        Ok(())
    }

    fn resparse(&self, image: &Path) -> Result<()> {
        Cmd::new("fallocate")
            .arg("--dig-holes")
            .arg_path(image)
            .error_msg(format!("Failed to resparse {}", image.display()))
            .run()?;
        Ok(())
    }

    fn copy_tree(&self, src: &Path, dest: &Path) -> Result<()> {
        let mut from = src.as_os_str().to_owned();
        from.push("/.");
        Cmd::new("cp")
            .arg("-a")
            .arg_path(Path::new(&from))
            .arg_path(dest)
            .error_msg(format!("Failed to copy {}", src.display()))
            .run()?;
        Ok(())
    }

    fn convert_qcow2(&self, raw: &Path, qcow2: &Path) -> Result<()> {
        if qcow2.exists() {
            std::fs::remove_file(qcow2)?;
        }
        Cmd::new("qemu-img")
            .args(["convert", "-f", "raw", "-O", "qcow2", "-c"])
            .arg_path(raw)
            .arg_path(qcow2)
            .error_msg("qemu-img convert failed")
            .run()?;
        Ok(())
    }
}
