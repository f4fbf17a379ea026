//! Shared test utilities for imgcraft tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use imgcraft::error::{Error, Result as CrateResult};
use imgcraft::imager::layout::DiskLayout;
use imgcraft::imager::DiskTools;
use imgcraft::kickstart::PartitionSpec;
use imgcraft::mount::Mounter;

/// Test environment with a root, a scratch parent and an output directory.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Canonical base path
    pub base: PathBuf,
    pub root: PathBuf,
    pub tmpdir: PathBuf,
    pub outdir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = fs::canonicalize(temp_dir.path()).expect("Failed to canonicalize temp dir");

        let root = base.join("root");
        let tmpdir = base.join("tmp");
        let outdir = base.join("out");
        for dir in [&root, &tmpdir] {
            fs::create_dir_all(dir).expect("Failed to create test dir");
        }

        Self {
            _temp_dir: temp_dir,
            base,
            root,
            tmpdir,
            outdir,
        }
    }

    /// Create a host-side directory to bind from.
    pub fn host_dir(&self, name: &str) -> PathBuf {
        let dir = self.base.join("host").join(name);
        fs::create_dir_all(&dir).expect("Failed to create host dir");
        dir
    }
}

/// Entries of a directory, sorted by file name.
pub fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

// =============================================================================
// GPT fixtures
// =============================================================================

pub const SECTOR: usize = 512;

/// One partition entry of a GPT fixture.
#[derive(Debug, Clone)]
pub struct EntryFixture {
    pub type_guid: [u8; 16],
    pub part_guid: [u8; 16],
    pub first_lba: u64,
    pub last_lba: u64,
    pub flags: u64,
    pub name: String,
}

impl EntryFixture {
    pub fn new(name: &str, first_lba: u64, last_lba: u64) -> Self {
        let seed = first_lba as u8;
        Self {
            type_guid: [0xAF; 16],
            part_guid: [seed.wrapping_add(1); 16],
            first_lba,
            last_lba,
            flags: 0,
            name: name.to_string(),
        }
    }

    fn encode(&self) -> [u8; 128] {
        let mut raw = [0u8; 128];
        raw[0..16].copy_from_slice(&self.type_guid);
        raw[16..32].copy_from_slice(&self.part_guid);
        raw[32..40].copy_from_slice(&self.first_lba.to_le_bytes());
        raw[40..48].copy_from_slice(&self.last_lba.to_le_bytes());
        raw[48..56].copy_from_slice(&self.flags.to_le_bytes());
        for (i, unit) in self.name.encode_utf16().take(36).enumerate() {
            raw[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        raw
    }
}

/// Disk image with a primary and a backup GPT.
///
/// Slots are fixed at 4 entries of 128 bytes, one sector per table.
pub struct GptFixture {
    pub total_sectors: u64,
    pub disk_guid: [u8; 16],
    pub slots: Vec<Option<EntryFixture>>,
}

pub const FIXTURE_SLOTS: u32 = 4;

impl GptFixture {
    pub fn new(total_sectors: u64, slots: Vec<Option<EntryFixture>>) -> Self {
        assert!(slots.len() <= FIXTURE_SLOTS as usize);
        Self {
            total_sectors,
            disk_guid: [
                0x28, 0x73, 0x2a, 0xc1, 0x1f, 0xf8, 0xd2, 0x11, 0xba, 0x4b, 0x00, 0xa0, 0xc9,
                0x3e, 0xc9, 0x3b,
            ],
            slots,
        }
    }

    pub fn last_lba(&self) -> u64 {
        self.total_sectors - 1
    }

    fn table(&self) -> Vec<u8> {
        let mut table = vec![0u8; SECTOR];
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(entry) = slot {
                table[i * 128..(i + 1) * 128].copy_from_slice(&entry.encode());
            }
        }
        table
    }

    /// Header bytes for the copy at `current`, pointing at `other` and a
    /// table at `table_lba`.
    pub fn header(&self, current: u64, other: u64, table_lba: u64) -> Vec<u8> {
        let table_crc = crc32fast::hash(&self.table()[..FIXTURE_SLOTS as usize * 128]);
        let mut h = vec![0u8; 92];
        h[0..8].copy_from_slice(b"EFI PART");
        h[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
        h[12..16].copy_from_slice(&92u32.to_le_bytes());
        h[24..32].copy_from_slice(&current.to_le_bytes());
        h[32..40].copy_from_slice(&other.to_le_bytes());
        h[40..48].copy_from_slice(&34u64.to_le_bytes());
        h[48..56].copy_from_slice(&(self.last_lba() - 33).to_le_bytes());
        h[56..72].copy_from_slice(&self.disk_guid);
        h[72..80].copy_from_slice(&table_lba.to_le_bytes());
        h[80..84].copy_from_slice(&FIXTURE_SLOTS.to_le_bytes());
        h[84..88].copy_from_slice(&128u32.to_le_bytes());
        h[88..92].copy_from_slice(&table_crc.to_le_bytes());
        reseal(&mut h);
        h
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut disk = vec![0u8; self.total_sectors as usize * SECTOR];
        let last = self.last_lba();

        put(&mut disk, 1, &self.header(1, last, 2));
        put(&mut disk, 2, &self.table());
        put(&mut disk, last - 1, &self.table());
        put(&mut disk, last, &self.header(last, 1, last - 1));
        disk
    }

    /// Write the image to `path` and return the path.
    pub fn write(&self, path: &Path) -> PathBuf {
        fs::write(path, self.to_bytes()).expect("Failed to write GPT fixture");
        path.to_path_buf()
    }
}

/// Recompute the CRC of a 92-byte header in place.
pub fn reseal(header: &mut [u8]) {
    header[16..20].fill(0);
    let crc = crc32fast::hash(&header[..92]);
    header[16..20].copy_from_slice(&crc.to_le_bytes());
}

/// Copy `data` into `disk` at sector `lba`.
pub fn put(disk: &mut [u8], lba: u64, data: &[u8]) {
    let at = lba as usize * SECTOR;
    disk[at..at + data.len()].copy_from_slice(data);
}

// =============================================================================
// Recording fakes
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountEvent {
    Bind(PathBuf),
    Mount { device: PathBuf, dest: PathBuf },
    Unmount { target: PathBuf, lazy: bool },
}

/// Mounter that records calls and keeps a fake live table.
#[derive(Default)]
pub struct FakeMounter {
    pub events: RefCell<Vec<MountEvent>>,
    live: RefCell<Vec<PathBuf>>,
    /// Fail `mount_device` for a destination ending in this path.
    pub fail_mount_on: Option<String>,
    /// Fail `bind` for a destination ending in this path.
    pub fail_bind_on: Option<String>,
    /// Path whose existence is sampled at every unmount.
    pub watched: Option<PathBuf>,
    pub sightings: RefCell<Vec<bool>>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_mount(suffix: &str) -> Self {
        Self {
            fail_mount_on: Some(suffix.to_string()),
            ..Self::default()
        }
    }

    pub fn failing_bind(suffix: &str) -> Self {
        Self {
            fail_bind_on: Some(suffix.to_string()),
            ..Self::default()
        }
    }

    pub fn watching(path: PathBuf) -> Self {
        Self {
            watched: Some(path),
            ..Self::default()
        }
    }

    /// Pretend something else mounted `path`.
    pub fn add_live(&self, path: impl Into<PathBuf>) {
        self.live.borrow_mut().push(path.into());
    }

    pub fn live(&self) -> Vec<PathBuf> {
        self.live.borrow().clone()
    }

    pub fn events(&self) -> Vec<MountEvent> {
        self.events.borrow().clone()
    }

    pub fn unmounted(&self) -> Vec<PathBuf> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                MountEvent::Unmount { target, .. } => Some(target.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Mounter for FakeMounter {
    fn bind(&self, _source: &Path, dest: &Path, _read_only: bool) -> CrateResult<()> {
        if let Some(suffix) = &self.fail_bind_on {
            if dest.ends_with(suffix.trim_start_matches('/')) {
                return Err(Error::Mount(format!("bind on {} failed", dest.display())));
            }
        }
        self.events
            .borrow_mut()
            .push(MountEvent::Bind(dest.to_path_buf()));
        self.live.borrow_mut().push(dest.to_path_buf());
        Ok(())
    }

    fn mount_device(
        &self,
        device: &Path,
        dest: &Path,
        _fstype: &str,
        _options: Option<&str>,
    ) -> CrateResult<()> {
        if let Some(suffix) = &self.fail_mount_on {
            if dest.ends_with(suffix.trim_start_matches('/')) {
                return Err(Error::Mount(format!("mount {} failed", dest.display())));
            }
        }
        self.events.borrow_mut().push(MountEvent::Mount {
            device: device.to_path_buf(),
            dest: dest.to_path_buf(),
        });
        self.live.borrow_mut().push(dest.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path, lazy: bool) -> CrateResult<()> {
        if let Some(watched) = &self.watched {
            self.sightings.borrow_mut().push(watched.exists());
        }
        self.events.borrow_mut().push(MountEvent::Unmount {
            target: target.to_path_buf(),
            lazy,
        });
        let mut live = self.live.borrow_mut();
        if let Some(pos) = live.iter().rposition(|p| p == target) {
            live.remove(pos);
        }
        Ok(())
    }

    fn mount_points(&self) -> CrateResult<Vec<PathBuf>> {
        Ok(self.live.borrow().clone())
    }
}

/// Disk tools that only record what they were asked to do.
#[derive(Default)]
pub struct FakeTools {
    pub events: RefCell<Vec<String>>,
    next_loop: Cell<u32>,
    /// Fail `format` for the partition with this mountpoint.
    pub fail_format_on: Option<String>,
}

impl FakeTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_format(mountpoint: &str) -> Self {
        Self {
            fail_format_on: Some(mountpoint.to_string()),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }

    fn record(&self, event: String) {
        self.events.borrow_mut().push(event);
    }
}

impl DiskTools for FakeTools {
    fn attach_loop(&self, image: &Path) -> anyhow::Result<String> {
        let n = self.next_loop.get();
        self.next_loop.set(n + 1);
        let device = format!("/dev/loop{}", n);
        self.record(format!(
            "attach {} {}",
            image.file_name().unwrap_or_default().to_string_lossy(),
            device
        ));
        Ok(device)
    }

    fn detach_loop(&self, device: &str) -> anyhow::Result<()> {
        self.record(format!("detach {}", device));
        Ok(())
    }

    fn partition(&self, device: &str, layout: &DiskLayout) -> anyhow::Result<()> {
        self.record(format!("partition {} {}", device, layout.table));
        Ok(())
    }

    fn format(&self, device: &str, spec: &PartitionSpec) -> anyhow::Result<()> {
        if self.fail_format_on.as_deref() == Some(spec.mountpoint.as_str()) {
            anyhow::bail!("mkfs exited with status 1");
        }
        self.record(format!("format {} {}", device, spec.mountpoint));
        Ok(())
    }

    fn set_flag(&self, device: &str, num: u32, flag: &str) -> anyhow::Result<()> {
        self.record(format!("set {} {} {}", device, num, flag));
        Ok(())
    }

    fn write_raw(&self, device: &str, data: &[u8]) -> anyhow::Result<usize> {
        self.record(format!("write_raw {} {}", device, data.len()));
        Ok(data.len())
    }

    fn sync(&self) {
        self.record("sync".to_string());
    }

    fn install_extlinux(&self, dir: &Path) -> anyhow::Result<()> {
        self.record(format!("extlinux {}", dir.display()));
        Ok(())
    }

    fn resparse(&self, image: &Path) -> anyhow::Result<()> {
        self.record(format!(
            "resparse {}",
            image.file_name().unwrap_or_default().to_string_lossy()
        ));
        Ok(())
    }

    fn copy_tree(&self, src: &Path, dest: &Path) -> anyhow::Result<()> {
        imgcraft::common::copy_tree(src, dest)?;
        self.record(format!("copy {} {}", src.display(), dest.display()));
        Ok(())
    }

    fn convert_qcow2(&self, raw: &Path, qcow2: &Path) -> anyhow::Result<()> {
        fs::copy(raw, qcow2)?;
        self.record(format!(
            "qcow2 {}",
            qcow2.file_name().unwrap_or_default().to_string_lossy()
        ));
        Ok(())
    }
}
