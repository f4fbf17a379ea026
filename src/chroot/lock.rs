//! Per-root exclusive lock.
//!
//! The lock is a sentinel file created with `O_CREAT|O_EXCL` inside the
//! target root. A second session on the same root fails immediately; there
//! is no waiting and no stale-lock recovery. An operator removes a lock left
//! behind by a crashed process by hand.

use log::debug;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const LOCK_FILE: &str = ".chroot.lock";

#[derive(Debug)]
pub struct ChrootLock {
    path: PathBuf,
    held: bool,
}

impl ChrootLock {
    /// Take the lock of `root`, failing with [`Error::Lock`] if another
    /// session holds it.
    pub fn acquire(root: &Path) -> Result<Self> {
        let path = root.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::Lock { path });
            }
            Err(e) => return Err(Error::io(&path, e)),
        };

        // owner pid
        if let Err(e) = writeln!(file, "{}", std::process::id()) {
            let _ = fs::remove_file(&path);
            return Err(Error::io(&path, e));
        }
        debug!("locked {}", path.display());
        Ok(Self { path, held: true })
    }

    /// Remove the sentinel. Releasing twice, or releasing a sentinel that is
    /// already gone, is not an error.
    pub fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("unlocked {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&self.path, e)),
        }
    }
}

impl Drop for ChrootLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
