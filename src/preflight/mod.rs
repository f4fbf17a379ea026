//! Preflight checks.
//!
//! Verifies host tools, privileges and kernel interfaces before a build.
//! Run with `imgcraft preflight`.

mod environment;
mod host_tools;
pub mod types;

use anyhow::{bail, Result};

use crate::config::Config;

pub use types::{CheckResult, CheckStatus, PreflightReport};

pub fn run_preflight(config: &Config) -> PreflightReport {
    let mut checks = Vec::new();

    println!("Checking host tools...");
    checks.extend(host_tools::check_host_tools());

    println!("Checking build environment...");
    checks.extend(environment::check_environment(config));
    println!();

    PreflightReport { checks }
}

/// Run preflight and bail if any check fails.
pub fn run_preflight_or_fail(config: &Config) -> Result<()> {
    let report = run_preflight(config);
    report.print();

    if !report.all_passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Fix the issues above before building.",
            report.fail_count()
        );
    }
    println!("All preflight checks passed!\n");
    Ok(())
}
