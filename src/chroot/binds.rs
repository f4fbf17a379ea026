//! Bind mount set of a chroot session.

use log::warn;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Host paths bound into every root, when present on the host.
pub const DEFAULT_BIND_MOUNTS: &[&str] = &[
    "/proc",
    "/proc/sys/fs/binfmt_misc",
    "/sys",
    "/dev",
    "/dev/pts",
    "/var/lib/dbus",
    "/var/run/dbus",
    "/var/lock",
    "/lib/modules",
];

/// Kernel module trees are exposed read-only.
const READ_ONLY_MOUNTS: &[&str] = &["/lib/modules"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMountSpec {
    /// Host path actually bound (symlinks resolved).
    pub source: PathBuf,
    /// Path inside the root; `None` means the same path as the source.
    pub dest: Option<PathBuf>,
    pub read_only: bool,
    /// Host path as given, when it was a symlink to `source`.
    pub link: Option<PathBuf>,
    pub mounted: bool,
}

impl BindMountSpec {
    pub fn new(source: impl Into<PathBuf>, dest: Option<PathBuf>) -> Self {
        let given = source.into();
        let read_only = READ_ONLY_MOUNTS.iter().any(|p| given == Path::new(p));
        let (source, link) = match resolve_link(&given) {
            Some(target) => (target, Some(given)),
            None => (given, None),
        };
        Self {
            source,
            dest,
            read_only,
            link,
            mounted: false,
        }
    }

    /// Absolute mount point of this bind under `root`.
    pub fn target_in(&self, root: &Path) -> PathBuf {
        let inner = self.dest.as_deref().unwrap_or(&self.source);
        root.join(inner.strip_prefix("/").unwrap_or(inner))
    }
}

fn resolve_link(path: &Path) -> Option<PathBuf> {
    let target = fs::read_link(path).ok()?;
    if target.is_absolute() {
        Some(target)
    } else {
        Some(path.parent().unwrap_or(Path::new("/")).join(target))
    }
}

/// Split `SRC[:DST]`. Empty halves count as absent.
pub fn parse_bind(spec: &str) -> (Option<PathBuf>, Option<PathBuf>) {
    let (src, dst) = match spec.split_once(':') {
        Some((s, d)) => (s, d),
        None => (spec, ""),
    };
    let opt = |s: &str| (!s.is_empty()).then(|| PathBuf::from(s));
    (opt(src), opt(dst))
}

/// Defaults that exist on this host, in the fixed order.
pub fn host_default_binds() -> Vec<PathBuf> {
    DEFAULT_BIND_MOUNTS
        .iter()
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
        .collect()
}

/// Build the ordered mount set for `root`: explicit binds first, then the
/// defaults.
///
/// An explicit source of `/` or one already among the defaults is dropped.
/// A missing explicit source is created. An explicit bind whose mount point
/// in the root is already in `live_mounts` is skipped with a warning.
pub fn compute_bind_mounts(
    root: &Path,
    explicit: &[String],
    defaults: &[PathBuf],
    live_mounts: &[PathBuf],
) -> Result<Vec<BindMountSpec>> {
    let mut set: Vec<BindMountSpec> = Vec::new();

    for raw in explicit {
        let (Some(src), dst) = parse_bind(raw) else {
            continue;
        };
        if src == Path::new("/") || DEFAULT_BIND_MOUNTS.iter().any(|d| src == Path::new(d)) {
            continue;
        }
        if !src.exists() {
            fs::create_dir_all(&src).map_err(|e| Error::io(&src, e))?;
        }

        let spec = BindMountSpec::new(src, dst);
        let target = spec.target_in(root);
        if live_mounts.iter().any(|m| *m == target) {
            warn!("{} is already mounted in {}, skipping", target.display(), root.display());
            continue;
        }
        if set.iter().any(|s| s.target_in(root) == target) {
            continue;
        }
        set.push(spec);
    }

    for default in defaults {
        set.push(BindMountSpec::new(default.clone(), None));
    }
    Ok(set)
}
