//! Bmap command - writes the block map of an image.

use anyhow::Result;
use std::path::{Path, PathBuf};

use imgcraft::bmap;

pub fn cmd_bmap(image: &Path, output: Option<PathBuf>) -> Result<()> {
    let output = output.unwrap_or_else(|| image.with_extension("bmap"));
    let map = bmap::write_bmap(image, &output)?;
    println!(
        "{}: {} of {} blocks mapped ({:.1}%), {} range(s)",
        image.display(),
        map.mapped_count,
        map.blocks_count,
        map.mapped_percent(),
        map.ranges.len()
    );
    println!("  [OK] {}", output.display());
    Ok(())
}
