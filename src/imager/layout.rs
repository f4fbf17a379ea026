//! Partition placement and mount ordering.

use std::path::Path;

use super::disk::DiskDescriptor;
use crate::kickstart::{PartitionSpec, PartitionTable};

pub const SECTOR_SIZE: u64 = 512;

/// First partition starts at this sector (1 MiB).
pub const FIRST_PARTITION_SECTOR: u64 = 2048;

/// Sectors the backup GPT occupies at the end of the disk.
pub const GPT_BACKUP_SECTORS: u64 = 33;

/// A partition with its place on the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedPartition {
    /// 1-based partition number.
    pub num: u32,
    pub disk: String,
    pub start_sector: u64,
    /// Inclusive.
    pub end_sector: u64,
    pub spec: PartitionSpec,
}

impl PlacedPartition {
    pub fn sectors(&self) -> u64 {
        self.end_sector - self.start_sector + 1
    }

    pub fn is_mountable(&self) -> bool {
        !self.spec.is_swap() && self.spec.mountpoint.starts_with('/')
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLayout {
    pub disk: String,
    pub table: PartitionTable,
    pub partitions: Vec<PlacedPartition>,
    /// Size of the backing file in bytes.
    pub file_size: u64,
}

fn round_up(value: u64, multiple: u64) -> u64 {
    if multiple == 0 {
        value
    } else {
        value.div_ceil(multiple) * multiple
    }
}

/// Place a disk's partitions in declaration order.
pub fn plan_layout(disk: &DiskDescriptor, table: PartitionTable) -> DiskLayout {
    let mut cursor = FIRST_PARTITION_SECTOR;
    let mut partitions = Vec::with_capacity(disk.partitions.len());

    for (i, spec) in disk.partitions.iter().enumerate() {
        let start = match spec.align {
            Some(align) if align > 0 => round_up(cursor * SECTOR_SIZE, align) / SECTOR_SIZE,
            _ => cursor,
        };
        let sectors = spec.size.div_ceil(SECTOR_SIZE).max(1);
        let end = start + sectors - 1;
        partitions.push(PlacedPartition {
            num: i as u32 + 1,
            disk: disk.name.clone(),
            start_sector: start,
            end_sector: end,
            spec: spec.clone(),
        });
        cursor = end + 1;
    }

    let trailer = match table {
        PartitionTable::Gpt => GPT_BACKUP_SECTORS,
        PartitionTable::Msdos => 0,
    };
    let needed = (cursor + trailer) * SECTOR_SIZE;

    DiskLayout {
        disk: disk.name.clone(),
        table,
        partitions,
        file_size: disk.size.max(needed),
    }
}

/// Device node of partition `num` on a partition-scanned loop device.
pub fn partition_device(device: &str, num: u32) -> String {
    format!("{}p{}", device, num)
}

fn depth(mountpoint: &str) -> usize {
    Path::new(mountpoint).components().count()
}

/// Mountable partitions, parents before children.
pub fn mount_order(layouts: &[DiskLayout]) -> Vec<&PlacedPartition> {
    let mut parts: Vec<&PlacedPartition> = layouts
        .iter()
        .flat_map(|l| l.partitions.iter())
        .filter(|p| p.is_mountable())
        .collect();
    parts.sort_by_key(|p| depth(&p.spec.mountpoint));
    parts
}

/// Partition holding `/boot`, else `/`.
pub fn boot_partition(layouts: &[DiskLayout]) -> Option<&PlacedPartition> {
    let all = || layouts.iter().flat_map(|l| l.partitions.iter());
    all()
        .find(|p| p.spec.mountpoint == "/boot")
        .or_else(|| all().find(|p| p.spec.mountpoint == "/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imager::disk::plan_disks;

    const MIB: u64 = 1024 * 1024;

    fn layouts(specs: Vec<PartitionSpec>, table: PartitionTable) -> Vec<DiskLayout> {
        plan_disks(&specs)
            .unwrap()
            .iter()
            .map(|d| plan_layout(d, table))
            .collect()
    }

    #[test]
    fn test_first_partition_at_one_mib() {
        let l = layouts(vec![PartitionSpec::new("/", 1900, "sda", "ext3")], PartitionTable::Msdos);
        let p = &l[0].partitions[0];
        assert_eq!(p.num, 1);
        assert_eq!(p.start_sector, 2048);
        assert_eq!(p.sectors() * SECTOR_SIZE, 1900 * MIB);
        assert_eq!(l[0].file_size, 1901 * MIB);
    }

    #[test]
    fn test_alignment_and_gpt_trailer() {
        let mut boot = PartitionSpec::new("/boot", 1, "sda", "vfat");
        boot.size = 1000 * SECTOR_SIZE;
        let mut root = PartitionSpec::new("/", 10, "sda", "ext4");
        root.align = Some(MIB);
        let l = layouts(vec![boot, root], PartitionTable::Gpt);

        let parts = &l[0].partitions;
        assert_eq!(parts[0].end_sector, 2048 + 1000 - 1);
        assert_eq!(parts[1].start_sector, 4096);
        assert_eq!(l[0].file_size, (4096 + 10 * 2048 + GPT_BACKUP_SECTORS) * SECTOR_SIZE);
    }

    #[test]
    fn test_mount_order_parents_first() {
        let l = layouts(
            vec![
                PartitionSpec::new("/var/log", 10, "sda", "ext4"),
                PartitionSpec::new("swap", 10, "sda", "swap"),
                PartitionSpec::new("/boot", 10, "sda", "ext4"),
                PartitionSpec::new("/", 10, "sda", "ext4"),
            ],
            PartitionTable::Msdos,
        );
        let order: Vec<&str> = mount_order(&l)
            .iter()
            .map(|p| p.spec.mountpoint.as_str())
            .collect();
        assert_eq!(order, vec!["/", "/boot", "/var/log"]);
    }

    #[test]
    fn test_boot_partition_selection() {
        let l = layouts(
            vec![
                PartitionSpec::new("/", 10, "sda", "ext4"),
                PartitionSpec::new("/boot", 10, "sda", "ext4"),
            ],
            PartitionTable::Msdos,
        );
        assert_eq!(boot_partition(&l).unwrap().num, 2);

        let l = layouts(vec![PartitionSpec::new("/", 10, "sda", "ext4")], PartitionTable::Msdos);
        assert_eq!(boot_partition(&l).unwrap().num, 1);
        assert_eq!(partition_device("/dev/loop3", 2), "/dev/loop3p2");
    }
}
