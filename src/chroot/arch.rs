//! Target architecture detection and user-mode emulation.

use anyhow::{bail, Context, Result};
use log::{debug, info};
use regex::Regex;
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::process::{self, Cmd};

/// Executables inspected, in order, to identify a root's architecture.
pub const ARCH_BINARIES: &[&str] = &[
    "/bin/bash",
    "/usr/bin/bash",
    "/sbin/init",
    "/usr/lib/systemd/systemd",
    "/bin/sh",
];

const BINFMT_DIR: &str = "/proc/sys/fs/binfmt_misc";

const PER_LINUX: libc::c_ulong = 0x0000;
const PER_LINUX32: libc::c_ulong = 0x0008;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    I686,
    Aarch64,
    Arm,
}

impl Arch {
    pub fn name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::I686 => "i686",
            Arch::Aarch64 => "aarch64",
            Arch::Arm => "arm",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "x86_64" | "amd64" => Some(Arch::X86_64),
            "i386" | "i586" | "i686" | "x86" => Some(Arch::I686),
            "aarch64" | "arm64" => Some(Arch::Aarch64),
            "arm" | "armv7l" | "armv7hl" => Some(Arch::Arm),
            _ => None,
        }
    }

    pub fn is_32bit(self) -> bool {
        matches!(self, Arch::I686 | Arch::Arm)
    }

    /// Execution domain for processes of this architecture.
    pub fn personality(self) -> libc::c_ulong {
        if self.is_32bit() {
            PER_LINUX32
        } else {
            PER_LINUX
        }
    }

    /// Suffix of the matching `qemu-<suffix>-static` emulator.
    pub fn qemu_name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::I686 => "i386",
            Arch::Aarch64 => "aarch64",
            Arch::Arm => "arm",
        }
    }

    /// ELF header magic and mask for binfmt_misc registration.
    fn binfmt_magic(self) -> (&'static str, &'static str) {
        match self {
            Arch::X86_64 => (
                r"\x7fELF\x02\x01\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x02\x00\x3e\x00",
                r"\xff\xff\xff\xff\xff\xfe\xfe\x00\xff\xff\xff\xff\xff\xff\xff\xff\xfe\xff\xff\xff",
            ),
            Arch::I686 => (
                r"\x7fELF\x01\x01\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x02\x00\x03\x00",
                r"\xff\xff\xff\xff\xff\xfe\xfe\x00\xff\xff\xff\xff\xff\xff\xff\xff\xfe\xff\xff\xff",
            ),
            Arch::Aarch64 => (
                r"\x7fELF\x02\x01\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x02\x00\xb7\x00",
                r"\xff\xff\xff\xff\xff\xff\xff\x00\xff\xff\xff\xff\xff\xff\xff\xff\xfe\xff\xff\xff",
            ),
            Arch::Arm => (
                r"\x7fELF\x01\x01\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x02\x00\x28\x00",
                r"\xff\xff\xff\xff\xff\xff\xff\x00\xff\xff\xff\xff\xff\xff\xff\xff\xfe\xff\xff\xff",
            ),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Architecture this process runs as.
pub fn host_arch() -> Result<Arch> {
    let arch = std::env::consts::ARCH;
    Arch::from_name(arch).with_context(|| format!("Unsupported host architecture '{}'", arch))
}

/// True when `host` executes `target` binaries without an emulator.
pub fn runs_natively(host: Arch, target: Arch) -> bool {
    host == target
        || matches!(
            (host, target),
            (Arch::X86_64, Arch::I686) | (Arch::Aarch64, Arch::Arm)
        )
}

fn signatures() -> &'static [(Regex, Arch)] {
    static TABLE: OnceLock<Vec<(Regex, Arch)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        [
            (r"x86-64", Arch::X86_64),
            (r"Intel 80[0-9]86|Intel i386", Arch::I686),
            (r"ARM aarch64", Arch::Aarch64),
            (r"ARM", Arch::Arm),
        ]
        .iter()
        .filter_map(|(pattern, arch)| Regex::new(pattern).ok().map(|re| (re, *arch)))
        .collect()
    })
}

/// Map a `file` description to an architecture; first matching signature
/// wins.
pub fn classify(description: &str) -> Option<Arch> {
    signatures()
        .iter()
        .find(|(re, _)| re.is_match(description))
        .map(|(_, arch)| *arch)
}

/// Detect the architecture of the root at `root` with `file -bL`.
pub fn detect(root: &Path) -> Result<Arch> {
    detect_with(root, |path| {
        Ok(Cmd::new("file")
            .arg("-bL")
            .arg_path(path)
            .run()?
            .stdout_trimmed()
            .to_string())
    })
}

/// Detection with a pluggable file-type query.
pub fn detect_with<F>(root: &Path, describe: F) -> Result<Arch>
where
    F: Fn(&Path) -> Result<String>,
{
    for binary in ARCH_BINARIES {
        let candidate = root.join(binary.trim_start_matches('/'));
        if !candidate.exists() {
            continue;
        }
        let description = describe(&candidate)?;
        debug!("{}: {}", candidate.display(), description);
        if let Some(arch) = classify(&description) {
            return Ok(arch);
        }
    }
    bail!("cannot determine architecture of {}", root.display())
}

/// Copy the static emulator for `arch` into `root/usr/bin` and make sure
/// the kernel routes foreign binaries to it. Returns the copied file.
pub fn install_emulator(root: &Path, arch: Arch) -> Result<PathBuf> {
    let name = format!("qemu-{}-static", arch.qemu_name());
    let host_path = process::find_binary(&name)
        .with_context(|| format!("{} is needed to run {} binaries", name, arch))?;

    let bin_dir = root.join("usr/bin");
    fs::create_dir_all(&bin_dir)
        .with_context(|| format!("Failed to create {}", bin_dir.display()))?;
    let dest = bin_dir.join(&name);
    fs::copy(&host_path, &dest).with_context(|| {
        format!(
            "Failed to copy {} to {}",
            host_path.display(),
            dest.display()
        )
    })?;
    fs::set_permissions(&dest, fs::Permissions::from_mode(0o755))?;
    info!("Installed emulator {}", dest.display());

    register_binfmt(arch, &format!("/usr/bin/{}", name))?;
    Ok(dest)
}

/// The binfmt_misc registration line for `arch`.
pub fn binfmt_rule(arch: Arch, interpreter: &str) -> String {
    let (magic, mask) = arch.binfmt_magic();
    format!(":{}:M::{}:{}:{}:\n", arch.qemu_name(), magic, mask, interpreter)
}

fn register_binfmt(arch: Arch, interpreter: &str) -> Result<()> {
    let dir = Path::new(BINFMT_DIR);
    let qemu = format!("qemu-{}", arch.qemu_name());
    if dir.join(arch.qemu_name()).exists() || dir.join(&qemu).exists() {
        debug!("binfmt handler for {} already registered", arch);
        return Ok(());
    }
    if !dir.join("register").exists() {
        bail!("binfmt_misc is not mounted on {}", BINFMT_DIR);
    }
    fs::write(dir.join("register"), binfmt_rule(arch, interpreter))
        .with_context(|| format!("Failed to register binfmt handler for {}", arch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_signature_order() {
        assert_eq!(
            classify("ELF 64-bit LSB pie executable, x86-64, version 1 (SYSV)"),
            Some(Arch::X86_64)
        );
        assert_eq!(
            classify("ELF 32-bit LSB executable, Intel 80386, version 1"),
            Some(Arch::I686)
        );
        assert_eq!(
            classify("ELF 64-bit LSB executable, ARM aarch64, version 1 (SYSV)"),
            Some(Arch::Aarch64)
        );
        assert_eq!(
            classify("ELF 32-bit LSB executable, ARM, EABI5 version 1 (SYSV)"),
            Some(Arch::Arm)
        );
        assert_eq!(classify("POSIX shell script, ASCII text executable"), None);
    }

    #[test]
    fn test_detect_skips_unmatched_binaries() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::create_dir_all(dir.path().join("sbin")).unwrap();
        fs::write(dir.path().join("bin/sh"), "").unwrap();
        fs::write(dir.path().join("sbin/init"), "").unwrap();

        let arch = detect_with(dir.path(), |p| {
            Ok(if p.ends_with("sbin/init") {
                "ASCII text".to_string()
            } else {
                "ELF 32-bit LSB executable, ARM, EABI5".to_string()
            })
        })
        .unwrap();
        assert_eq!(arch, Arch::Arm);
    }

    #[test]
    fn test_detect_without_binaries_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = detect_with(dir.path(), |_| Ok(String::new())).unwrap_err();
        assert!(err.to_string().contains("cannot determine architecture"));
    }

    #[test]
    fn test_native_compatibility() {
        assert!(runs_natively(Arch::X86_64, Arch::I686));
        assert!(runs_natively(Arch::Aarch64, Arch::Arm));
        assert!(!runs_natively(Arch::I686, Arch::X86_64));
        assert!(!runs_natively(Arch::X86_64, Arch::Arm));
    }

    #[test]
    fn test_personality_values() {
        assert_eq!(Arch::I686.personality(), 0x0008);
        assert_eq!(Arch::Arm.personality(), 0x0008);
        assert_eq!(Arch::X86_64.personality(), 0);
    }

    #[test]
    fn test_binfmt_rule_shape() {
        let rule = binfmt_rule(Arch::Arm, "/usr/bin/qemu-arm-static");
        assert!(rule.starts_with(":arm:M::\\x7fELF"));
        assert!(rule.ends_with(":/usr/bin/qemu-arm-static:\n"));
    }
}
