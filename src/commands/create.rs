//! Create command - builds disk images from a kickstart file.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use imgcraft::archive::Compression;
use imgcraft::bootstrap;
use imgcraft::chroot::arch;
use imgcraft::config::{Config, Runtime};
use imgcraft::imager::{self, CreateOptions, ImageFormat, SystemTools};
use imgcraft::kickstart::Kickstart;
use imgcraft::mount::SystemMounter;
use imgcraft::timing::Timer;

pub struct CreateArgs {
    pub ksfile: PathBuf,
    pub format: String,
    pub name: Option<String>,
    pub outdir: Option<PathBuf>,
    pub generate_bmap: bool,
    pub checksum: bool,
    pub compress: Option<String>,
    pub pack_to: Option<String>,
    pub rootfs: Option<PathBuf>,
    pub shell: bool,
    pub runtime: Option<String>,
}

/// Image name used when none is given: the kickstart file's stem.
pub fn default_name(args: &CreateArgs) -> String {
    args.ksfile
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

pub fn cmd_create(config: &Config, args: CreateArgs) -> Result<()> {
    let runtime = match &args.runtime {
        Some(name) => Runtime::from_name(name)?,
        None => config.runtime,
    };
    let format = ImageFormat::from_name(&args.format)?;
    let compress = args.compress.as_deref().map(Compression::from_name).transpose()?;

    if !nix::unistd::geteuid().is_root() {
        bail!("imgcraft create must be run as root");
    }

    if runtime == Runtime::Bootstrap && !bootstrap::in_bootstrap() {
        let argv: Vec<String> = std::env::args().collect();
        let code = bootstrap::relocate_and_run(config, Some(&args.ksfile), &argv, &SystemMounter)?;
        if code != 0 {
            bail!("build inside the bootstrap root exited with {}", code);
        }
        return Ok(());
    }

    let ks = Kickstart::from_file(&args.ksfile)?;
    let opts = CreateOptions {
        name: args.name.clone().unwrap_or_else(|| default_name(&args)),
        format,
        outdir: args.outdir.clone().unwrap_or_else(|| config.outdir.clone()),
        tmpdir: config.tmpdir.clone(),
        generate_bmap: args.generate_bmap,
        checksum: args.checksum,
        compress,
        pack_to: args.pack_to.clone(),
        rootfs: args.rootfs.clone(),
        shell: args.shell,
        arch: arch::host_arch()?.name().to_string(),
        vcpu: config.vcpu,
        vmem_mb: config.vmem_mb,
    };

    println!("=== Creating {} image '{}' ===\n", opts.format, opts.name);
    let timer = Timer::start("Total");
    let report = imager::create(&ks, &opts, &SystemTools, &SystemMounter)
        .with_context(|| format!("Building '{}' failed", opts.name))?;
    timer.finish();

    println!("\n=== Image ready ===");
    for image in &report.images {
        println!("  {}", image.display());
    }
    println!("  {}", report.descriptor.display());
    if let Some(map) = &report.mountpoints {
        println!("  {}", map.display());
    }
    Ok(())
}
