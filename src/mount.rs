//! Mount primitives.
//!
//! Lifecycle code talks to the kernel mount table only through [`Mounter`],
//! so session and builder ordering can be exercised with a recording fake.

use log::debug;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::process::Cmd;

/// Live mount table.
pub const PROC_MOUNTS: &str = "/proc/mounts";

pub trait Mounter {
    /// Bind `source` onto `dest`, optionally read-only.
    fn bind(&self, source: &Path, dest: &Path, read_only: bool) -> Result<()>;

    /// Mount a block device carrying a filesystem.
    fn mount_device(
        &self,
        device: &Path,
        dest: &Path,
        fstype: &str,
        options: Option<&str>,
    ) -> Result<()>;

    /// Unmount `target`; `lazy` detaches it even while busy.
    fn unmount(&self, target: &Path, lazy: bool) -> Result<()>;

    /// Mount points currently in the live table, in table order.
    fn mount_points(&self) -> Result<Vec<PathBuf>>;
}

/// The host kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn bind(&self, source: &Path, dest: &Path, read_only: bool) -> Result<()> {
        debug!("bind {} -> {}", source.display(), dest.display());
        mount(Some(source), dest, None::<&str>, MsFlags::MS_BIND, None::<&str>).map_err(|e| {
            Error::Mount(format!(
                "bind {} on {} failed: {}",
                source.display(),
                dest.display(),
                e
            ))
        })?;

        if read_only {
            let flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
            if let Err(e) = mount(None::<&str>, dest, None::<&str>, flags, None::<&str>) {
                let _ = umount2(dest, MntFlags::MNT_DETACH);
                return Err(Error::Mount(format!(
                    "read-only remount of {} failed: {}",
                    dest.display(),
                    e
                )));
            }
        }
        Ok(())
    }

    fn mount_device(
        &self,
        device: &Path,
        dest: &Path,
        fstype: &str,
        options: Option<&str>,
    ) -> Result<()> {
        let mut cmd = Cmd::new("mount").args(["-t", fstype]);
        if let Some(opts) = options {
            cmd = cmd.args(["-o", opts]);
        }
        cmd.arg_path(device)
            .arg_path(dest)
            .run()
            .map(|_| ())
            .map_err(|e| Error::Mount(format!("{:#}", e)))
    }

    fn unmount(&self, target: &Path, lazy: bool) -> Result<()> {
        debug!("umount {}{}", target.display(), if lazy { " (lazy)" } else { "" });
        let flags = if lazy {
            MntFlags::MNT_DETACH
        } else {
            MntFlags::empty()
        };
        umount2(target, flags)
            .map_err(|e| Error::Mount(format!("umount {} failed: {}", target.display(), e)))
    }

    fn mount_points(&self) -> Result<Vec<PathBuf>> {
        let text = fs::read_to_string(PROC_MOUNTS).map_err(|e| Error::io(PROC_MOUNTS, e))?;
        Ok(parse_mount_points(&text))
    }
}

/// Mount points of a `/proc/mounts` style table.
pub fn parse_mount_points(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|p| PathBuf::from(unescape_octal(p)))
        .collect()
}

/// The kernel writes spaces, tabs, newlines and backslashes as `\ooo`.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b));
        if escaped {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Entries at or below `root`, newest first (the order they must be
/// unmounted in).
pub fn mounts_under(mount_points: &[PathBuf], root: &Path) -> Vec<PathBuf> {
    mount_points
        .iter()
        .rev()
        .filter(|p| p.starts_with(root))
        .cloned()
        .collect()
}
