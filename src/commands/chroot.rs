//! Chroot command - runs a command inside a root directory or image file.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

use imgcraft::chroot::{self, image, Arch, ChrootOptions};
use imgcraft::config::Config;
use imgcraft::imager::SystemTools;
use imgcraft::mount::SystemMounter;

/// Returns the command's exit code.
pub fn cmd_chroot(
    config: &Config,
    target: &Path,
    binds: Vec<String>,
    command: Vec<String>,
    arch: Option<&str>,
    saveto: Option<PathBuf>,
) -> Result<i32> {
    if !nix::unistd::geteuid().is_root() {
        bail!("imgcraft chroot must be run as root");
    }

    let arch = match arch {
        Some(name) => match Arch::from_name(name) {
            Some(arch) => Some(arch),
            None => bail!("Unknown architecture '{}'", name),
        },
        None => None,
    };
    let opts = ChrootOptions {
        binds,
        command,
        workdir: None,
        no_default_binds: false,
        arch,
        saveto,
    };

    if target.is_dir() {
        chroot::run_in_chroot(target, &opts, &SystemMounter)
    } else if target.is_file() {
        image::run_in_image(target, &opts, &SystemTools, &SystemMounter, &config.tmpdir)
    } else {
        bail!("{} is neither a directory nor an image file", target.display())
    }
}
