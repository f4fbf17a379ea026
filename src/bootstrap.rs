//! Bootstrap self-relocation.
//!
//! Copies the running tool, its support trees and its configuration into a
//! prepared minimal root, then re-runs the current invocation inside that
//! root through a chroot session.

use anyhow::{Context, Result};
use log::{debug, info};
use regex::Regex;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::chroot::{self, arch, lock::LOCK_FILE, ChrootOptions};
use crate::common::files;
use crate::config::{self, Config};
use crate::error::Error;
use crate::mount::Mounter;

/// Where the relocated executable lives inside the root.
pub const RELOCATED_BIN: &str = "/usr/bin/imgcraft";

/// Inode of a filesystem's root directory on the usual Linux filesystems.
const ROOT_INODE: u64 = 2;

/// True when this process already runs inside a bootstrap root.
pub fn in_bootstrap() -> bool {
    in_bootstrap_at(Path::new("/"))
}

pub fn in_bootstrap_at(root: &Path) -> bool {
    if root.join(LOCK_FILE).exists() {
        return true;
    }
    match fs::metadata(root) {
        Ok(meta) => meta.ino() != ROOT_INODE,
        Err(_) => false,
    }
}

/// Host-side pieces copied into the root.
#[derive(Debug, Clone)]
pub struct RuntimeSources {
    pub exe: PathBuf,
    pub libdir: PathBuf,
    pub plugindir: PathBuf,
    pub config: Option<PathBuf>,
}

impl RuntimeSources {
    pub fn from_config(config: &Config) -> Result<Self> {
        let exe = std::env::current_exe().context("Cannot locate the running executable")?;
        Ok(Self {
            exe,
            libdir: config.libdir.clone(),
            plugindir: config.plugindir.clone(),
            config: config.source.clone(),
        })
    }
}

fn in_root(root: &Path, path: &Path) -> PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}

fn bootstrap_err(what: &str, e: anyhow::Error) -> anyhow::Error {
    Error::Bootstrap(format!("{}: {:#}", what, e)).into()
}

/// Copy the tool into `root`. Returns the relocated executable.
pub fn sync_runtime(root: &Path, sources: &RuntimeSources) -> Result<PathBuf> {
    let bin = in_root(root, Path::new(RELOCATED_BIN));
    files::copy_file_with_dirs(&sources.exe, &bin)
        .map_err(|e| bootstrap_err("copying executable", e))?;

    let mut trees = vec![&sources.libdir];
    if !sources.plugindir.starts_with(&sources.libdir) {
        trees.push(&sources.plugindir);
    }
    for tree in trees {
        if !tree.is_dir() {
            debug!("{} does not exist, not copied", tree.display());
            continue;
        }
        let n = files::copy_tree(tree, &in_root(root, tree))
            .map_err(|e| bootstrap_err(&format!("copying {}", tree.display()), e))?;
        debug!("copied {} files from {}", n, tree.display());
    }

    let conf_dest = in_root(root, Path::new(config::DEFAULT_CONFIG_FILE));
    let conf_text = match &sources.config {
        Some(path) => fs::read_to_string(path)
            .map_err(|e| bootstrap_err(&format!("reading {}", path.display()), e.into()))?,
        None => String::new(),
    };
    files::write_file_with_dirs(&conf_dest, force_auto_backend(&conf_text))
        .map_err(|e| bootstrap_err("writing configuration", e))?;

    fs::set_permissions(&bin, fs::Permissions::from_mode(0o755))
        .map_err(|e| bootstrap_err("chmod", e.into()))?;
    rewrite_interpreter(&bin).map_err(|e| bootstrap_err("rewriting interpreter", e))?;

    info!("Relocated {} into {}", sources.exe.display(), root.display());
    Ok(bin)
}

/// Set `PKGMGR=auto`, replacing any existing assignment.
pub fn force_auto_backend(conf: &str) -> String {
    let re = match Regex::new(r"(?m)^[ \t]*PKGMGR[ \t]*=.*$") {
        Ok(re) => re,
        Err(_) => return format!("{}PKGMGR=auto\n", conf),
    };
    if re.is_match(conf) {
        return re.replace_all(conf, "PKGMGR=auto").into_owned();
    }
    let mut out = conf.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("PKGMGR=auto\n");
    out
}

/// Point a relocated script at an interpreter found through `PATH` inside
/// the root. Native executables are left untouched. Returns whether the
/// file changed.
pub fn rewrite_interpreter(path: &Path) -> Result<bool> {
    let content = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if !content.starts_with(b"#!") {
        debug!("{} is not a script, interpreter kept", path.display());
        return Ok(false);
    }

    let end = content
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(content.len());
    let shebang = String::from_utf8_lossy(&content[2..end]).into_owned();
    let mut words = shebang.split_whitespace();
    let interp = words.next().unwrap_or_default();
    let program = if Path::new(interp).ends_with("env") {
        words.next().unwrap_or_default().to_string()
    } else {
        Path::new(interp)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    if program.is_empty() {
        return Ok(false);
    }

    let mut rewritten = format!("#!/usr/bin/env {}", program).into_bytes();
    rewritten.extend_from_slice(&content[end..]);
    fs::write(path, rewritten).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

/// Host paths the inner invocation needs, bound into the root at the same
/// location: sorted, absolute and without duplicates.
pub fn bind_paths(config: &Config, ksfile: Option<&Path>, cwd: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = vec![
        cwd.to_path_buf(),
        config.tmpdir.clone(),
        config.cachedir.clone(),
        config.outdir.clone(),
    ];
    dirs.extend(config.local_pkgs.iter().cloned());
    dirs.extend(config.local_repos.iter().cloned());

    let file_dirs = [config.logfile.as_deref(), ksfile]
        .into_iter()
        .flatten()
        .filter_map(|f| {
            let abs = config::expand_path(&f.to_string_lossy(), cwd);
            abs.parent().map(Path::to_path_buf)
        });
    dirs.extend(file_dirs);

    let mut dirs: Vec<PathBuf> = dirs
        .into_iter()
        .map(|d| config::expand_path(&d.to_string_lossy(), cwd))
        .collect();
    dirs.sort();
    dirs.dedup();
    dirs
}

/// Relocate into `config.bootstrap_root` and re-run `argv` there. Returns
/// the inner exit code.
pub fn relocate_and_run(
    config: &Config,
    ksfile: Option<&Path>,
    argv: &[String],
    mounter: &dyn Mounter,
) -> Result<i32> {
    if in_bootstrap() {
        return Err(Error::Bootstrap("already running inside a bootstrap root".to_string()).into());
    }

    let root = &config.bootstrap_root;
    if !root.join("usr/bin").is_dir() {
        return Err(Error::Bootstrap(format!(
            "{} does not look like a prepared bootstrap root",
            root.display()
        ))
        .into());
    }

    let sources = RuntimeSources::from_config(config)?;
    sync_runtime(root, &sources)?;

    let target = arch::detect(root)?;
    let host = arch::host_arch()?;
    if target != host {
        info!("bootstrap root is {}, host is {}", target, host);
    }

    let cwd = std::env::current_dir().context("Cannot determine working directory")?;
    let binds = bind_paths(config, ksfile, &cwd)
        .into_iter()
        .map(|p| p.display().to_string())
        .collect();

    let mut command = vec![RELOCATED_BIN.to_string()];
    command.extend(argv.iter().skip(1).cloned());

    let opts = ChrootOptions {
        binds,
        command,
        workdir: Some(cwd),
        no_default_binds: false,
        arch: Some(target),
        saveto: None,
    };
    println!("Starting imgcraft in bootstrap root {}", root.display());
    chroot::run_in_chroot(root, &opts, mounter)
}
