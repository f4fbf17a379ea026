//! Compression and packing of finished images.

use anyhow::{bail, Result};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gz,
    Bz2,
    Xz,
    Lzo,
}

impl Compression {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "gz" | "gzip" => Ok(Compression::Gz),
            "bz2" | "bzip2" => Ok(Compression::Bz2),
            "xz" => Ok(Compression::Xz),
            "lzo" | "lzop" => Ok(Compression::Lzo),
            other => bail!("Unknown compression '{}' (expected gz, bz2, xz or lzo)", other),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Compression::Gz => "gz",
            Compression::Bz2 => "bz2",
            Compression::Xz => "xz",
            Compression::Lzo => "lzo",
        }
    }

    fn tool(self) -> &'static str {
        match self {
            Compression::Gz => "gzip",
            Compression::Bz2 => "bzip2",
            Compression::Xz => "xz",
            Compression::Lzo => "lzop",
        }
    }

    /// Flags that compress in place, dropping the input.
    fn flags(self) -> &'static [&'static str] {
        match self {
            // lzop keeps its input unless told otherwise
            Compression::Lzo => &["-f", "-U"],
            _ => &["-f"],
        }
    }

    /// GNU tar switch filtering an archive through this compressor.
    fn tar_flag(self) -> &'static str {
        match self {
            Compression::Gz => "-z",
            Compression::Bz2 => "-j",
            Compression::Xz => "-J",
            Compression::Lzo => "--lzop",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

/// Path the compressor writes for `path`.
pub fn compressed_path(path: &Path, compression: Compression) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(compression.extension());
    PathBuf::from(name)
}

/// Compress `path` in place, replacing it with `<path>.<ext>`. Returns the
/// archived path.
pub fn compress(path: &Path, compression: Compression) -> Result<PathBuf> {
    let out = compressed_path(path, compression);
    if out.exists() {
        std::fs::remove_file(&out)?;
    }
    Cmd::new(compression.tool())
        .args(compression.flags())
        .arg_path(path)
        .error_msg(format!("{} of {} failed", compression.tool(), path.display()))
        .run()?;
    if !out.exists() {
        bail!("{} did not produce {}", compression.tool(), out.display());
    }
    Ok(out)
}

/// Tarball suffixes and the compressor each implies.
const TARBALL_SUFFIXES: &[(&str, Option<Compression>)] = &[
    (".tar.gz", Some(Compression::Gz)),
    (".tgz", Some(Compression::Gz)),
    (".taz", Some(Compression::Gz)),
    (".tar.bz2", Some(Compression::Bz2)),
    (".tar.bz", Some(Compression::Bz2)),
    (".tbz2", Some(Compression::Bz2)),
    (".tbz", Some(Compression::Bz2)),
    (".tar.xz", Some(Compression::Xz)),
    (".txz", Some(Compression::Xz)),
    (".tar.lzo", Some(Compression::Lzo)),
    (".tzo", Some(Compression::Lzo)),
    (".tar", None),
];

/// Split a tarball name into its stem and compressor, by suffix.
pub fn tarball_kind(name: &str) -> Result<(&str, Option<Compression>)> {
    for (suffix, compression) in TARBALL_SUFFIXES {
        if let Some(stem) = name.strip_suffix(suffix).filter(|s| !s.is_empty()) {
            return Ok((stem, *compression));
        }
    }
    bail!("Unknown archive suffix in '{}' (expected .tar, .tar.gz, .tar.bz2, .tar.xz or .tar.lzo)", name)
}

/// Pack `members` of `dir` into the tarball `archive`, keeping holes. The
/// compressor follows from the archive's suffix.
pub fn pack(archive: &Path, dir: &Path, members: &[String]) -> Result<()> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (_, compression) = tarball_kind(&name)?;
    if members.is_empty() {
        bail!("nothing to pack into {}", archive.display());
    }

    let mut cmd = Cmd::new("tar").arg("-S");
    if let Some(compression) = compression {
        cmd = cmd.arg(compression.tar_flag());
    }
    cmd.arg("-cf")
        .arg_path(archive)
        .arg("-C")
        .arg_path(dir)
        .args(members)
        .error_msg(format!("Failed to pack {}", archive.display()))
        .run()?;
    Ok(())
}
