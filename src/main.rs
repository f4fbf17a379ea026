//! imgcraft - bootable disk images from kickstart layouts.
//!
//! - `create` builds raw or qcow2 disks, optionally from a bootstrap root
//! - `chroot` enters a root directory or an image file
//! - `gpt` and `bmap` inspect images

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use imgcraft::config::Config;
use imgcraft::gpt::DEFAULT_SECTOR_SIZE;

#[derive(Parser)]
#[command(name = "imgcraft")]
#[command(about = "Bootable disk image builder")]
#[command(
    after_help = "QUICK START:\n  imgcraft preflight              Check host tools\n  imgcraft create image.ks         Build raw disk images\n  imgcraft chroot image-sda.raw    Open a shell inside an image"
)]
struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: /etc/imgcraft/imgcraft.conf)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build disk images from a kickstart file
    Create {
        ksfile: PathBuf,

        /// Image format: raw, qcow2 or loop
        #[arg(short, long, default_value = "raw")]
        format: String,

        /// Image name (default: kickstart file name)
        #[arg(short, long)]
        name: Option<String>,

        /// Output directory (default: IMGCRAFT_OUTDIR)
        #[arg(short, long)]
        outdir: Option<PathBuf>,

        /// Write a block map next to each raw disk
        #[arg(long)]
        generate_bmap: bool,

        /// Record SHA-256/SHA-512 checksums in the descriptor
        #[arg(long)]
        checksum: bool,

        /// Compress finished disks: gz, bz2, xz or lzo
        #[arg(long)]
        compress: Option<String>,

        /// Pack finished files into this tarball (.tar, .tgz, .tar.bz2, .tar.xz, .tzo)
        #[arg(long)]
        pack_to: Option<String>,

        /// Populate the image from a prepared root directory
        #[arg(long)]
        rootfs: Option<PathBuf>,

        /// Open a shell in the image before it is finalised
        #[arg(long)]
        shell: bool,

        /// native or bootstrap (default: IMGCRAFT_RUNTIME)
        #[arg(long)]
        runtime: Option<String>,
    },

    /// Run a command inside a root directory or image file
    Chroot {
        target: PathBuf,

        /// Extra bind mount SRC[:DST] (repeatable)
        #[arg(short, long = "bind")]
        bind: Vec<String>,

        /// Architecture of the root (default: detected)
        #[arg(long)]
        arch: Option<String>,

        /// Copy the root to this directory before entering it
        #[arg(short, long)]
        saveto: Option<PathBuf>,

        /// Command to run (default: /bin/bash)
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Print the GPT of a device or image
    Gpt {
        image: PathBuf,

        /// Read the backup header and table
        #[arg(long)]
        backup: bool,

        #[arg(long, default_value_t = DEFAULT_SECTOR_SIZE)]
        sector_size: u64,
    },

    /// Write the block map of a sparse image
    Bmap {
        image: PathBuf,

        /// Output file (default: <image>.bmap)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },

    /// Run preflight checks
    Preflight {
        /// Fail if any check fails (exit code 1)
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show effective configuration
    Config,
    /// Show a build descriptor
    Descriptor { path: PathBuf },
    /// Show the mountpoint map of a loop build
    Mountpoints { path: PathBuf },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Create {
            ksfile,
            format,
            name,
            outdir,
            generate_bmap,
            checksum,
            compress,
            pack_to,
            rootfs,
            shell,
            runtime,
        } => {
            commands::cmd_create(
                &config,
                commands::CreateArgs {
                    ksfile,
                    format,
                    name,
                    outdir,
                    generate_bmap,
                    checksum,
                    compress,
                    pack_to,
                    rootfs,
                    shell,
                    runtime,
                },
            )?;
        }

        Commands::Chroot {
            target,
            bind,
            arch,
            saveto,
            command,
        } => {
            let code =
                commands::cmd_chroot(&config, &target, bind, command, arch.as_deref(), saveto)?;
            if code != 0 {
                std::process::exit(code);
            }
        }

        Commands::Gpt {
            image,
            backup,
            sector_size,
        } => {
            commands::cmd_gpt(&image, backup, sector_size)?;
        }

        Commands::Bmap { image, output } => {
            commands::cmd_bmap(&image, output)?;
        }

        Commands::Show { what } => {
            let target = match what {
                ShowTarget::Config => commands::ShowTarget::Config,
                ShowTarget::Descriptor { path } => commands::ShowTarget::Descriptor(path),
                ShowTarget::Mountpoints { path } => commands::ShowTarget::Mountpoints(path),
            };
            commands::cmd_show(target, &config)?;
        }

        Commands::Preflight { strict } => {
            commands::cmd_preflight(&config, strict)?;
        }
    }

    Ok(())
}
