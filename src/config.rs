//! Configuration management for imgcraft.
//!
//! Reads a `KEY=value` site configuration file and the environment.
//! Environment variables take precedence over the file.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Site configuration read when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/imgcraft/imgcraft.conf";

pub const DEFAULT_TMPDIR: &str = "/var/tmp/imgcraft";
pub const DEFAULT_OUTDIR: &str = "imgcraft-output";
pub const DEFAULT_LIBDIR: &str = "/usr/lib/imgcraft";
pub const DEFAULT_BOOTSTRAP_ROOT: &str = "/var/tmp/imgcraft-bootstrap";

/// Where a build runs: directly on the host, or inside a relocated copy of
/// the tool in a bootstrap root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runtime {
    Native,
    Bootstrap,
}

impl Runtime {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "native" => Ok(Runtime::Native),
            "bootstrap" => Ok(Runtime::Bootstrap),
            other => bail!("Unknown runtime '{}' (expected native or bootstrap)", other),
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Runtime::Native => write!(f, "native"),
            Runtime::Bootstrap => write!(f, "bootstrap"),
        }
    }
}

/// imgcraft configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Configuration file this was read from, if any.
    pub source: Option<PathBuf>,
    /// Scratch area parent (build work dirs live below it)
    pub tmpdir: PathBuf,
    pub cachedir: PathBuf,
    /// Final images and descriptors
    pub outdir: PathBuf,
    /// Support library tree copied into bootstrap roots
    pub libdir: PathBuf,
    pub plugindir: PathBuf,
    pub logfile: Option<PathBuf>,
    /// Package manager backend name
    pub pkgmgr: String,
    pub runtime: Runtime,
    pub bootstrap_root: PathBuf,
    pub local_pkgs: Vec<PathBuf>,
    pub local_repos: Vec<PathBuf>,
    pub vcpu: u32,
    pub vmem_mb: u64,
}

impl Config {
    /// Load configuration from a file and the environment.
    ///
    /// An explicitly named file must exist; the default site file is
    /// optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (file, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        let mut vars = HashMap::new();
        let mut source = None;

        if file.exists() {
            let iter = dotenvy::from_path_iter(&file)
                .with_context(|| format!("Failed to read config {}", file.display()))?;
            for item in iter {
                let (key, value) =
                    item.with_context(|| format!("Malformed config {}", file.display()))?;
                vars.insert(key, value);
            }
            source = Some(file);
        } else if required {
            bail!("Config file not found: {}", file.display());
        }

        // Environment variables override the file
        for (key, value) in std::env::vars() {
            vars.insert(key, value);
        }

        let cwd = std::env::current_dir().context("Cannot determine working directory")?;
        Self::from_vars(&vars, &cwd, source)
    }

    /// Build a config from already-merged variables. Relative paths resolve
    /// against `base_dir`.
    pub fn from_vars(
        vars: &HashMap<String, String>,
        base_dir: &Path,
        source: Option<PathBuf>,
    ) -> Result<Self> {
        let get = |key: &str| vars.get(key).map(|s| s.trim()).filter(|s| !s.is_empty());
        let path_or = |key: &str, default: PathBuf| {
            get(key)
                .map(|s| expand_path(s, base_dir))
                .unwrap_or(default)
        };

        let tmpdir = path_or("IMGCRAFT_TMPDIR", PathBuf::from(DEFAULT_TMPDIR));
        let cachedir = path_or("IMGCRAFT_CACHEDIR", tmpdir.join("cache"));
        let outdir = path_or("IMGCRAFT_OUTDIR", base_dir.join(DEFAULT_OUTDIR));
        let libdir = path_or("IMGCRAFT_LIBDIR", PathBuf::from(DEFAULT_LIBDIR));
        let plugindir = path_or("IMGCRAFT_PLUGINDIR", libdir.join("plugins"));
        let logfile = get("IMGCRAFT_LOGFILE").map(|s| expand_path(s, base_dir));
        let bootstrap_root = path_or(
            "IMGCRAFT_BOOTSTRAP_ROOT",
            PathBuf::from(DEFAULT_BOOTSTRAP_ROOT),
        );

        let pkgmgr = get("PKGMGR").unwrap_or("auto").to_string();
        let runtime = Runtime::from_name(get("IMGCRAFT_RUNTIME").unwrap_or("native"))?;

        let path_list = |key: &str| -> Vec<PathBuf> {
            get(key)
                .map(|s| {
                    s.split(':')
                        .filter(|p| !p.is_empty())
                        .map(|p| expand_path(p, base_dir))
                        .collect()
                })
                .unwrap_or_default()
        };
        let local_pkgs = path_list("IMGCRAFT_LOCAL_PKGS");
        let local_repos = path_list("IMGCRAFT_LOCAL_REPOS");

        let vcpu = match get("IMGCRAFT_VCPU") {
            Some(v) => v
                .parse()
                .with_context(|| format!("IMGCRAFT_VCPU must be a number, got '{}'", v))?,
            None => 1,
        };
        let vmem_mb = match get("IMGCRAFT_VMEM_MB") {
            Some(v) => v
                .parse()
                .with_context(|| format!("IMGCRAFT_VMEM_MB must be a number, got '{}'", v))?,
            None => 512,
        };

        Ok(Self {
            source,
            tmpdir,
            cachedir,
            outdir,
            libdir,
            plugindir,
            logfile,
            pkgmgr,
            runtime,
            bootstrap_root,
            local_pkgs,
            local_repos,
            vcpu,
            vmem_mb,
        })
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        match &self.source {
            Some(path) => println!("  (from {})", path.display()),
            None => println!("  (defaults and environment only)"),
        }
        println!("  IMGCRAFT_TMPDIR: {}", self.tmpdir.display());
        println!("  IMGCRAFT_CACHEDIR: {}", self.cachedir.display());
        println!("  IMGCRAFT_OUTDIR: {}", self.outdir.display());
        println!("  IMGCRAFT_LIBDIR: {}", self.libdir.display());
        println!("  IMGCRAFT_PLUGINDIR: {}", self.plugindir.display());
        match &self.logfile {
            Some(log) => println!("  IMGCRAFT_LOGFILE: {}", log.display()),
            None => println!("  IMGCRAFT_LOGFILE: (none)"),
        }
        println!("  PKGMGR: {}", self.pkgmgr);
        println!("  IMGCRAFT_RUNTIME: {}", self.runtime);
        println!("  IMGCRAFT_BOOTSTRAP_ROOT: {}", self.bootstrap_root.display());
        println!("  IMGCRAFT_LOCAL_PKGS: {}", join_paths(&self.local_pkgs));
        println!("  IMGCRAFT_LOCAL_REPOS: {}", join_paths(&self.local_repos));
        println!("  IMGCRAFT_VCPU: {}", self.vcpu);
        println!("  IMGCRAFT_VMEM_MB: {}", self.vmem_mb);
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "(none)".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

/// Expand a leading `~` and make the path absolute against `base_dir`.
pub fn expand_path(raw: &str, base_dir: &Path) -> PathBuf {
    let expanded = if raw == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
    } else if let Some(rest) = raw.strip_prefix("~/") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/"))
            .join(rest)
    } else {
        PathBuf::from(raw)
    };

    if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    }
}
