//! Preflight check results.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    /// A build will fail.
    Fail,
    /// Some optional feature (qcow2, compression, ...) is unavailable.
    Warn,
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: Option<String>,
}

impl CheckResult {
    pub fn pass(name: &str, details: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            details,
        }
    }

    pub fn fail(name: &str, details: String) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Fail,
            details: Some(details),
        }
    }

    pub fn warn(name: &str, details: String) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warn,
            details: Some(details),
        }
    }
}

pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    pub fn all_passed(&self) -> bool {
        self.count(CheckStatus::Fail) == 0
    }

    pub fn fail_count(&self) -> usize {
        self.count(CheckStatus::Fail)
    }

    pub fn print(&self) {
        println!("=== Preflight ===\n");
        for check in &self.checks {
            let marker = match check.status {
                CheckStatus::Pass => "[OK]  ",
                CheckStatus::Fail => "[FAIL]",
                CheckStatus::Warn => "[WARN]",
            };
            match &check.details {
                Some(details) => println!("  {} {}: {}", marker, check.name, details),
                None => println!("  {} {}", marker, check.name),
            }
        }

        println!(
            "\n{}/{} passed",
            self.count(CheckStatus::Pass),
            self.checks.len()
        );
        let failed = self.fail_count();
        if failed > 0 {
            println!("{} FAILED, image builds will not succeed", failed);
        }
        let warned = self.count(CheckStatus::Warn);
        if warned > 0 {
            println!("{} warnings", warned);
        }
    }
}
