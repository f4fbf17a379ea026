//! Block map generation for sparse images.
//!
//! A block map lists which blocks of an image hold data, so a flasher can
//! skip the holes. It must be produced before the image is copied or
//! compressed, while the holes still exist.
//!
//! The generator never writes to the image.

use anyhow::{Context, Result};
use libc::off_t;
use log::{debug, info};
use nix::errno::Errno;
use nix::unistd::{lseek, Whence};
use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::checksum::{self, HashAlgo};

/// Format version written into the XML document.
pub const BMAP_VERSION: &str = "2.0";

/// A maximal run of mapped blocks, `first..=last`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMapRange {
    pub first: u64,
    pub last: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockMap {
    pub image_size: u64,
    pub block_size: u64,
    pub blocks_count: u64,
    pub ranges: Vec<BlockMapRange>,
    pub mapped_count: u64,
}

impl BlockMap {
    pub fn mapped_percent(&self) -> f64 {
        if self.blocks_count == 0 {
            return 0.0;
        }
        self.mapped_count as f64 * 100.0 / self.blocks_count as f64
    }

    /// Render the bmap XML document, including its self checksum.
    pub fn to_xml(&self) -> String {
        let placeholder = "0".repeat(64);
        let xml = self.render_xml(&placeholder);
        let own = checksum::bytes_digest(xml.as_bytes());
        xml.replacen(&placeholder, &own, 1)
    }

    fn render_xml(&self, file_checksum: &str) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" ?>\n\n");
        xml.push_str("<!-- Block map of an image file: only the listed blocks hold data\n");
        xml.push_str("     and have to be copied to the target device. Flashing the whole\n");
        xml.push_str("     image instead is always correct, just slower. -->\n");
        xml.push_str(&format!("<bmap version=\"{}\">\n", BMAP_VERSION));
        xml.push_str(&format!(
            "    <!-- Image size in bytes: {} -->\n",
            human_size(self.image_size)
        ));
        xml.push_str(&format!("    <ImageSize> {} </ImageSize>\n\n", self.image_size));
        xml.push_str("    <!-- Size of a block in bytes -->\n");
        xml.push_str(&format!("    <BlockSize> {} </BlockSize>\n\n", self.block_size));
        xml.push_str("    <!-- Count of blocks in the image file -->\n");
        xml.push_str(&format!(
            "    <BlocksCount> {} </BlocksCount>\n\n",
            self.blocks_count
        ));
        xml.push_str(&format!(
            "    <!-- Count of mapped blocks: {} or {:.1}% -->\n",
            human_size(self.mapped_count * self.block_size),
            self.mapped_percent()
        ));
        xml.push_str(&format!(
            "    <MappedBlocksCount> {} </MappedBlocksCount>\n\n",
            self.mapped_count
        ));
        xml.push_str(&format!(
            "    <ChecksumType> {} </ChecksumType>\n\n",
            HashAlgo::Sha256.name()
        ));
        xml.push_str(&format!(
            "    <BmapFileChecksum> {} </BmapFileChecksum>\n\n",
            file_checksum
        ));
        xml.push_str("    <BlockMap>\n");
        for range in &self.ranges {
            if range.first == range.last {
                xml.push_str(&format!(
                    "        <Range chksum=\"{}\"> {} </Range>\n",
                    range.checksum, range.first
                ));
            } else {
                xml.push_str(&format!(
                    "        <Range chksum=\"{}\"> {}-{} </Range>\n",
                    range.checksum, range.first, range.last
                ));
            }
        }
        xml.push_str("    </BlockMap>\n");
        xml.push_str("</bmap>\n");
        xml
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Collapse a per-block mapped flag sequence into maximal `(first, last)` runs
/// of mapped blocks.
pub fn collapse_runs(mapped: &[bool]) -> Vec<(u64, u64)> {
    let mut runs = Vec::new();
    let mut start: Option<u64> = None;

    for (i, &m) in mapped.iter().enumerate() {
        let i = i as u64;
        match (m, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push((s, i - 1));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push((s, mapped.len() as u64 - 1));
    }
    runs
}

/// Host filesystem block size of the file's backing store.
fn host_block_size(file: &File) -> Result<u64> {
    let blksize = file.metadata()?.blksize();
    Ok(if blksize == 0 { 4096 } else { blksize })
}

/// Which blocks of `file` are backed by storage. Uses SEEK_DATA/SEEK_HOLE;
/// a filesystem without hole reporting gets every block marked mapped.
fn mapped_blocks(file: &File, size: u64, block_size: u64) -> Vec<bool> {
    let blocks = size.div_ceil(block_size) as usize;
    let mut mapped = vec![false; blocks];
    let end = size as off_t;
    let mut pos: off_t = 0;

    while pos < end {
        let data = match lseek(file, pos, Whence::SeekData) {
            Ok(data) => data,
            // No data past `pos`.
            Err(Errno::ENXIO) => break,
            Err(e) => {
                debug!("SEEK_DATA unsupported ({}), treating all blocks as mapped", e);
                return vec![true; blocks];
            }
        };
        let hole = lseek(file, data, Whence::SeekHole).map_or(end, |h| h.min(end));
        if hole <= data {
            break;
        }

        let first = data as u64 / block_size;
        let last = (hole as u64 - 1) / block_size;
        for flag in &mut mapped[first as usize..=last as usize] {
            *flag = true;
        }
        pos = hole;
    }
    mapped
}

/// Build the block map of `image` from an explicit per-block mapping.
pub fn from_mapping(image: &Path, block_size: u64, mapped: &[bool]) -> Result<BlockMap> {
    let image_size = fs::metadata(image)
        .with_context(|| format!("Failed to stat {}", image.display()))?
        .len();
    let blocks_count = image_size.div_ceil(block_size);

    let mut ranges = Vec::new();
    let mut mapped_count = 0;
    for (first, last) in collapse_runs(mapped) {
        mapped_count += last - first + 1;
        let checksum = checksum::file_digest(
            image,
            Some(first * block_size..(last + 1) * block_size),
            HashAlgo::Sha256,
        )?;
        ranges.push(BlockMapRange {
            first,
            last,
            checksum,
        });
    }

    Ok(BlockMap {
        image_size,
        block_size,
        blocks_count,
        ranges,
        mapped_count,
    })
}

/// Generate the block map of a sparse image.
pub fn generate(image: &Path) -> Result<BlockMap> {
    let file =
        File::open(image).with_context(|| format!("Failed to open {}", image.display()))?;
    let size = file.metadata()?.len();
    let block_size = host_block_size(&file)?;
    let mapped = mapped_blocks(&file, size, block_size);
    from_mapping(image, block_size, &mapped)
}

/// Generate the block map of `image` and write it as XML to `bmap_path`.
pub fn write_bmap(image: &Path, bmap_path: &Path) -> Result<BlockMap> {
    info!("Generating block map {}", bmap_path.display());
    let map = generate(image)?;
    fs::write(bmap_path, map.to_xml())
        .with_context(|| format!("Failed to write {}", bmap_path.display()))?;
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapse_runs() {
        let m = [false, true, true, false, true, false, false, true];
        assert_eq!(collapse_runs(&m), vec![(1, 2), (4, 4), (7, 7)]);
    }

    #[test]
    fn test_collapse_runs_edges() {
        assert!(collapse_runs(&[]).is_empty());
        assert!(collapse_runs(&[false; 5]).is_empty());
        assert_eq!(collapse_runs(&[true; 5]), vec![(0, 4)]);
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(1024 * 1024), "1.0 MiB");
    }

    #[test]
    fn test_xml_self_checksum_verifies() {
        let map = BlockMap {
            image_size: 8192,
            block_size: 4096,
            blocks_count: 2,
            ranges: vec![BlockMapRange {
                first: 0,
                last: 0,
                checksum: "ab".repeat(32),
            }],
            mapped_count: 1,
        };
        let xml = map.to_xml();
        let start = xml.find("<BmapFileChecksum> ").unwrap() + "<BmapFileChecksum> ".len();
        let stored = &xml[start..start + 64];
        let zeroed = xml.replacen(stored, &"0".repeat(64), 1);
        assert_eq!(checksum::bytes_digest(zeroed.as_bytes()), stored);
        assert!(xml.contains("<Range chksum=\""));
        assert!(xml.contains("> 0 </Range>"));
        assert!(xml.contains("<MappedBlocksCount> 1 </MappedBlocksCount>"));
    }

    #[test]
    fn test_percent_of_empty_image() {
        let map = BlockMap {
            image_size: 0,
            block_size: 4096,
            blocks_count: 0,
            ranges: vec![],
            mapped_count: 0,
        };
        assert_eq!(map.mapped_percent(), 0.0);
    }
}
