//! Chroot session lifecycle.
//!
//! A session walks `Idle -> Locked -> Mounted -> Running -> TornDown`. Every
//! acquisition pushes its release step onto the session's teardown list, and
//! the list runs once, newest first, whether the body succeeded or not. The
//! lock is pushed first, so it is released last.

pub mod arch;
pub mod binds;
pub mod image;
pub mod lock;

use anyhow::Context;
use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::mount::{self, Mounter};
use crate::process::Cmd;
use crate::teardown::Teardown;

pub use arch::Arch;
pub use binds::BindMountSpec;
pub use lock::ChrootLock;

pub const DEFAULT_COMMAND: &str = "/bin/bash";

/// Host-specific entries dropped from a saved copy of a root.
const UNSAVED_ENTRIES: &[&str] = &[
    "dev/fd",
    "dev/stdin",
    "dev/stdout",
    "dev/stderr",
    "etc/mtab",
    lock::LOCK_FILE,
];

const HOST_RESOLV: &str = "/etc/resolv.conf";
const HOST_MTAB: &str = "/etc/mtab";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Locked,
    Mounted,
    Running,
    TornDown,
}

/// Release actions, recorded as resources are acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseStep {
    ReleaseLock,
    SweepMounts,
    RemoveEmulator(PathBuf),
    Unbind(PathBuf),
    TruncateResolv,
    RemoveMtab,
    KillProcesses,
}

/// What to run and how to set the root up.
#[derive(Debug, Clone, Default)]
pub struct ChrootOptions {
    /// `SRC[:DST]` binds in addition to the default set.
    pub binds: Vec<String>,
    /// Command and arguments; empty means an interactive shell.
    pub command: Vec<String>,
    /// Directory to start in, inside the root. Defaults to `/`.
    pub workdir: Option<PathBuf>,
    /// Skip the default system binds.
    pub no_default_binds: bool,
    /// Architecture of the root, when known. Skips detection.
    pub arch: Option<Arch>,
    /// Copy the root here before entering it.
    pub saveto: Option<PathBuf>,
}

pub struct ChrootSession<'m> {
    root: PathBuf,
    mounter: &'m dyn Mounter,
    lock: Option<ChrootLock>,
    mounts: Vec<BindMountSpec>,
    arch: Option<Arch>,
    emulator: Option<PathBuf>,
    /// Mount points under the root that existed before the session.
    preexisting: Vec<PathBuf>,
    teardown: Teardown<ReleaseStep>,
    state: SessionState,
}

impl<'m> ChrootSession<'m> {
    pub fn new(root: impl Into<PathBuf>, mounter: &'m dyn Mounter) -> Self {
        Self {
            root: root.into(),
            mounter,
            lock: None,
            mounts: Vec::new(),
            arch: None,
            emulator: None,
            preexisting: Vec::new(),
            teardown: Teardown::new(),
            state: SessionState::Idle,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn arch(&self) -> Option<Arch> {
        self.arch
    }

    pub fn mounts(&self) -> &[BindMountSpec] {
        &self.mounts
    }

    /// Release steps still pending, in the order they will run.
    pub fn pending_release(&self) -> Vec<ReleaseStep> {
        self.teardown.pending().cloned().collect()
    }

    fn require(&self, allowed: &[SessionState], action: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::Mount(format!(
                "cannot {} {} in state {:?}",
                action,
                self.root.display(),
                self.state
            )))
        }
    }

    /// Take the root's lock. Fails with [`Error::Lock`] if it is held.
    pub fn acquire_lock(&mut self) -> Result<()> {
        self.require(&[SessionState::Idle], "lock")?;
        if !self.root.is_dir() {
            return Err(Error::Mount(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        self.root = fs::canonicalize(&self.root).map_err(|e| Error::io(&self.root, e))?;

        self.lock = Some(ChrootLock::acquire(&self.root)?);
        self.teardown.push(ReleaseStep::ReleaseLock);

        self.preexisting = match self.mounter.mount_points() {
            Ok(points) => mount::mounts_under(&points, &self.root),
            Err(e) => {
                debug!("cannot read mount table: {}", e);
                Vec::new()
            }
        };
        self.teardown.push(ReleaseStep::SweepMounts);
        self.state = SessionState::Locked;
        Ok(())
    }

    /// Record the root's architecture and, when the host cannot run it
    /// natively, install an emulator into the root.
    pub fn prepare_arch(&mut self, target: Arch, host: Arch) -> anyhow::Result<()> {
        self.require(&[SessionState::Locked], "prepare")?;
        self.arch = Some(target);
        if arch::runs_natively(host, target) {
            return Ok(());
        }
        let emulator = arch::install_emulator(&self.root, target)?;
        self.teardown
            .push(ReleaseStep::RemoveEmulator(emulator.clone()));
        self.emulator = Some(emulator);
        Ok(())
    }

    /// Bind every spec in order. A failure leaves the binds made so far on
    /// the teardown list.
    pub fn mount_binds(&mut self, specs: Vec<BindMountSpec>) -> Result<()> {
        self.require(&[SessionState::Locked, SessionState::Mounted], "mount in")?;

        for mut spec in specs {
            let target = spec.target_in(&self.root);
            create_mount_point(&spec.source, &target)?;
            self.mounter.bind(&spec.source, &target, spec.read_only)?;
            info!("bind {} -> {}", spec.source.display(), target.display());
            spec.mounted = true;
            self.teardown.push(ReleaseStep::Unbind(target));

            if let Some(link) = &spec.link {
                let inner = self.root.join(link.strip_prefix("/").unwrap_or(link));
                if fs::symlink_metadata(&inner).is_err() {
                    let _ = std::os::unix::fs::symlink(&spec.source, &inner);
                }
            }
            self.mounts.push(spec);
        }
        self.state = SessionState::Mounted;
        Ok(())
    }

    /// Copy the host resolver configuration and mount table stub. Failures
    /// here only warn.
    pub fn setup_host_files(&mut self) {
        let etc = self.root.join("etc");
        if let Err(e) = fs::create_dir_all(&etc) {
            warn!("cannot create {}: {}", etc.display(), e);
            return;
        }

        if let Err(e) = fs::copy(HOST_RESOLV, etc.join("resolv.conf")) {
            debug!("resolv.conf not copied: {}", e);
        }
        self.teardown.push(ReleaseStep::TruncateResolv);

        let mtab = etc.join("mtab");
        if fs::symlink_metadata(&mtab).map(|m| m.file_type().is_symlink()).unwrap_or(false) {
            return;
        }
        match fs::copy(HOST_MTAB, &mtab) {
            Ok(_) => self.teardown.push(ReleaseStep::RemoveMtab),
            Err(e) => debug!("mtab not copied: {}", e),
        }
    }

    /// Run a command inside the root and return its exit code.
    pub fn run(&mut self, command: &[String], workdir: Option<&Path>) -> anyhow::Result<i32> {
        self.require(&[SessionState::Locked, SessionState::Mounted], "run in")?;
        self.teardown.push(ReleaseStep::KillProcesses);
        self.state = SessionState::Running;

        let argv: Vec<String> = if command.is_empty() {
            vec![DEFAULT_COMMAND.to_string()]
        } else {
            command.to_vec()
        };
        let root_c = CString::new(self.root.as_os_str().as_bytes())
            .context("root path contains a NUL byte")?;
        let dir_c = CString::new(workdir.unwrap_or(Path::new("/")).as_os_str().as_bytes())
            .context("working directory contains a NUL byte")?;
        let persona = self.arch.map(|a| a.personality());

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if let Some(p) = persona {
                    if libc::personality(p) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if libc::chroot(root_c.as_ptr()) != 0 || libc::chdir(dir_c.as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        info!("running {:?} in {}", argv, self.root.display());
        let status = cmd
            .status()
            .with_context(|| format!("chroot {} failed to start {}", self.root.display(), argv[0]))?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Run every pending release step. Idempotent.
    pub fn teardown(&mut self) -> Vec<anyhow::Error> {
        if self.teardown.is_done() {
            return Vec::new();
        }
        let mut teardown = std::mem::take(&mut self.teardown);
        let failures = teardown.run(|step| self.release(step));
        self.teardown = teardown;
        self.state = SessionState::TornDown;
        failures
    }

    fn release(&mut self, step: &ReleaseStep) -> anyhow::Result<()> {
        match step {
            ReleaseStep::KillProcesses => {
                kill_processes_in(&self.root);
                Ok(())
            }
            ReleaseStep::RemoveMtab => remove_if_present(&self.root.join("etc/mtab")),
            ReleaseStep::TruncateResolv => {
                let path = self.root.join("etc/resolv.conf");
                match OpenOptions::new().write(true).truncate(true).open(&path) {
                    Ok(_) => Ok(()),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(Error::io(&path, e).into()),
                }
            }
            ReleaseStep::Unbind(target) => {
                self.mounter.unmount(target, true)?;
                if let Some(spec) = self
                    .mounts
                    .iter_mut()
                    .find(|m| m.target_in(&self.root) == *target)
                {
                    spec.mounted = false;
                }
                Ok(())
            }
            ReleaseStep::RemoveEmulator(path) => {
                self.emulator = None;
                remove_if_present(path)
            }
            ReleaseStep::SweepMounts => {
                self.sweep_mounts();
                Ok(())
            }
            ReleaseStep::ReleaseLock => match self.lock.as_mut() {
                Some(lock) => lock.release().map_err(Into::into),
                None => Ok(()),
            },
        }
    }

    /// Lazily unmount anything still mounted under the root that the session
    /// did not find there, and remove the emptied mount points.
    fn sweep_mounts(&self) {
        let points = match self.mounter.mount_points() {
            Ok(p) => p,
            Err(e) => {
                warn!("cannot read mount table: {}", e);
                return;
            }
        };

        for point in mount::mounts_under(&points, &self.root) {
            if self.preexisting.contains(&point) {
                continue;
            }
            if let Err(e) = self.mounter.unmount(&point, true) {
                warn!("failed to unmount {}: {}", point.display(), e);
            }
            if point == self.root {
                continue;
            }
            let empty = fs::read_dir(&point)
                .map(|mut d| d.next().is_none())
                .unwrap_or(false);
            if empty {
                let _ = fs::remove_dir(&point);
            } else {
                warn!("{} is not an empty directory, left in place", point.display());
            }
        }
    }
}

impl Drop for ChrootSession<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn create_mount_point(source: &Path, target: &Path) -> Result<()> {
    if source.is_dir() {
        fs::create_dir_all(target).map_err(|e| Error::io(target, e))
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        if !target.exists() {
            fs::File::create(target).map_err(|e| Error::io(target, e))?;
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e).into()),
    }
}

/// Copy `root` to `dest` with `cp -af`, then drop the entries that only make
/// sense on the running host. `dest` must not exist yet.
pub fn save_root(root: &Path, dest: &Path) -> anyhow::Result<()> {
    let root = fs::canonicalize(root).map_err(|e| Error::io(root, e))?;
    if dest == root || fs::canonicalize(dest).ok().as_deref() == Some(root.as_path()) {
        anyhow::bail!("{} is the root being entered, not saving onto it", dest.display());
    }
    if fs::symlink_metadata(dest).is_ok() {
        anyhow::bail!("{} already exists, not saving the root there", dest.display());
    }
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    info!("Saving {} to {}", root.display(), dest.display());
    Cmd::new("cp")
        .arg("-af")
        .arg_path(&root)
        .arg_path(dest)
        .error_msg(format!("Failed to save {} to {}", root.display(), dest.display()))
        .run()?;

    for entry in UNSAVED_ENTRIES {
        let path = dest.join(entry);
        let removed = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(_) => continue,
        };
        removed.map_err(|e| Error::io(&path, e))?;
    }
    Ok(())
}

/// SIGKILL every process whose root directory is `root`.
pub fn kill_processes_in(root: &Path) {
    let Ok(entries) = fs::read_dir("/proc") else {
        return;
    };
    let me = std::process::id() as i32;

    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<i32>().ok())
        else {
            continue;
        };
        if pid == me {
            continue;
        }
        match fs::read_link(entry.path().join("root")) {
            Ok(link) if link == root => {
                debug!("killing {} (rooted in {})", pid, root.display());
                if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                    warn!("failed to kill {}: {}", pid, e);
                }
            }
            _ => {}
        }
    }
}

/// Enter `root`, run `opts.command` and tear everything down again.
///
/// The returned value is the command's exit code. Teardown failures are
/// logged but do not replace the command's result.
pub fn run_in_chroot(
    root: &Path,
    opts: &ChrootOptions,
    mounter: &dyn Mounter,
) -> anyhow::Result<i32> {
    let mut session = ChrootSession::new(root, mounter);
    let result = enter_and_run(&mut session, opts);
    let failures = session.teardown();
    if !failures.is_empty() {
        warn!(
            "{} teardown step(s) failed for {}",
            failures.len(),
            root.display()
        );
    }
    result
}

fn enter_and_run(session: &mut ChrootSession<'_>, opts: &ChrootOptions) -> anyhow::Result<i32> {
    session.acquire_lock()?;

    let target = match opts.arch {
        Some(arch) => arch,
        None => arch::detect(session.root())?,
    };
    let host = arch::host_arch()?;
    session.prepare_arch(target, host)?;

    if let Some(dest) = &opts.saveto {
        save_root(session.root(), dest)?;
    }

    let defaults = if opts.no_default_binds {
        Vec::new()
    } else {
        binds::host_default_binds()
    };
    let live = session.mounter.mount_points().unwrap_or_default();
    let specs = binds::compute_bind_mounts(session.root(), &opts.binds, &defaults, &live)?;
    session.mount_binds(specs)?;
    session.setup_host_files();

    session.run(&opts.command, opts.workdir.as_deref())
}
