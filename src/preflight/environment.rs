//! Privileges and kernel interfaces a build needs.

use std::fs;
use std::path::Path;

use super::types::CheckResult;
use crate::config::Config;

const LOOP_CONTROL: &str = "/dev/loop-control";
const BINFMT_MISC: &str = "/proc/sys/fs/binfmt_misc";

pub fn check_environment(config: &Config) -> Vec<CheckResult> {
    let mut results = Vec::new();

    if nix::unistd::geteuid().is_root() {
        results.push(CheckResult::pass("root privileges", None));
    } else {
        results.push(CheckResult::fail(
            "root privileges",
            "loop devices, mounts and chroot need root".to_string(),
        ));
    }

    results.push(check_writable("tmpdir", &config.tmpdir));
    results.push(check_writable("outdir", &config.outdir));

    if Path::new(LOOP_CONTROL).exists() {
        results.push(CheckResult::pass("loop devices", None));
    } else {
        results.push(CheckResult::fail(
            "loop devices",
            format!("{} missing, load the loop module", LOOP_CONTROL),
        ));
    }

    if Path::new(BINFMT_MISC).join("register").exists() {
        results.push(CheckResult::pass("binfmt_misc", None));
    } else {
        results.push(CheckResult::warn(
            "binfmt_misc",
            "not mounted, foreign-architecture roots cannot be entered".to_string(),
        ));
    }

    results
}

/// Check that `dir` exists (or can be created) and accepts files.
pub fn check_writable(name: &str, dir: &Path) -> CheckResult {
    if let Err(e) = fs::create_dir_all(dir) {
        return CheckResult::fail(name, format!("cannot create {}: {}", dir.display(), e));
    }
    let marker = dir.join(".imgcraft-preflight");
    match fs::write(&marker, "") {
        Ok(()) => {
            let _ = fs::remove_file(&marker);
            CheckResult::pass(name, Some(dir.display().to_string()))
        }
        Err(e) => CheckResult::fail(name, format!("cannot write to {}: {}", dir.display(), e)),
    }
}
