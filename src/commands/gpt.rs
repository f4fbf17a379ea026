//! GPT command - prints the partition table of a device or image.

use anyhow::{Context, Result};
use std::path::Path;

use imgcraft::gpt::GptParser;

pub fn cmd_gpt(path: &Path, backup: bool, sector_size: u64) -> Result<()> {
    let parser = GptParser::with_sector_size(path, sector_size)?;
    let header = parser
        .read_header(!backup)
        .with_context(|| format!("Cannot read GPT of {}", path.display()))?;

    println!("{} ({} header)", path.display(), if backup { "backup" } else { "primary" });
    println!("  disk UUID:     {}", header.disk_uuid);
    println!("  revision:      {:#010x}", header.revision);
    println!("  current LBA:   {}", header.current_lba);
    println!("  backup LBA:    {}", header.backup_lba);
    println!(
        "  usable LBAs:   {}-{}",
        header.first_usable_lba, header.last_usable_lba
    );
    println!(
        "  entries:       {} x {} bytes at LBA {}",
        header.entry_count, header.entry_size, header.partition_table_lba
    );
    println!();
    println!("  {:>3}  {:>12}  {:>12}  {:<36}  name", "#", "first", "last", "partition UUID");

    for entry in parser.get_partitions(!backup)? {
        let entry = entry?;
        println!(
            "  {:>3}  {:>12}  {:>12}  {:<36}  {}",
            entry.index + 1,
            entry.first_lba,
            entry.last_lba,
            entry.part_uuid,
            entry.name
        );
    }
    Ok(())
}
