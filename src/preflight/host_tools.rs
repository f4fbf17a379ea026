//! Host tool availability.

use super::types::CheckResult;
use crate::process;

/// (tool, package, what needs it)
const REQUIRED_TOOLS: &[(&str, &str, &str)] = &[
    ("losetup", "util-linux", "loop devices"),
    ("mount", "util-linux", "mounting partitions"),
    ("parted", "parted", "partition tables and boot flags"),
    ("mkfs.ext4", "e2fsprogs", "ext filesystems"),
    ("tune2fs", "e2fsprogs", "ext filesystem tuning"),
    ("mkswap", "util-linux", "swap partitions"),
    ("fallocate", "util-linux", "resparsing images"),
    ("file", "file", "architecture detection"),
];

const OPTIONAL_TOOLS: &[(&str, &str, &str)] = &[
    ("mkfs.vfat", "dosfstools", "vfat partitions"),
    ("mkfs.btrfs", "btrfs-progs", "btrfs partitions"),
    ("extlinux", "syslinux", "bootloader install"),
    ("qemu-img", "qemu-img", "--format qcow2"),
    ("gzip", "gzip", "--compress gz"),
    ("bzip2", "bzip2", "--compress bz2"),
    ("xz", "xz", "--compress xz"),
];

pub fn check_host_tools() -> Vec<CheckResult> {
    let required = REQUIRED_TOOLS.iter().map(|t| (t, true));
    let optional = OPTIONAL_TOOLS.iter().map(|t| (t, false));
    required
        .chain(optional)
        .map(|(&(tool, package, purpose), required)| {
            check_tool_exists(tool, package, purpose, required)
        })
        .collect()
}

pub fn check_tool_exists(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    match process::which(tool) {
        Some(path) => CheckResult::pass(tool, Some(path.display().to_string())),
        None => {
            let msg = format!("not found, install '{}' (needed for {})", package, purpose);
            if required {
                CheckResult::fail(tool, msg)
            } else {
                CheckResult::warn(tool, msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::types::CheckStatus;

    #[test]
    fn test_missing_tool_severity() {
        let r = check_tool_exists("imgcraft-no-such-tool", "pkg", "tests", true);
        assert_eq!(r.status, CheckStatus::Fail);
        assert!(r.details.unwrap().contains("'pkg'"));

        let r = check_tool_exists("imgcraft-no-such-tool", "pkg", "tests", false);
        assert_eq!(r.status, CheckStatus::Warn);
    }

    #[test]
    fn test_every_tool_checked() {
        assert_eq!(
            check_host_tools().len(),
            REQUIRED_TOOLS.len() + OPTIONAL_TOOLS.len()
        );
    }
}
