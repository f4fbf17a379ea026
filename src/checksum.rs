//! File digests for block maps and image descriptors.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256, Sha512};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::Path;

const CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Sha256,
    Sha512,
}

impl HashAlgo {
    pub fn name(self) -> &'static str {
        match self {
            HashAlgo::Sha256 => "sha256",
            HashAlgo::Sha512 => "sha512",
        }
    }
}

/// Hex digest of `path`, or of the byte `range` of it. A range running past
/// the end of the file is cut at EOF.
pub fn file_digest(path: &Path, range: Option<Range<u64>>, algo: HashAlgo) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {} for hashing", path.display()))?;

    let (start, mut remaining) = match range {
        Some(r) => (r.start, Some(r.end.saturating_sub(r.start))),
        None => (0, None),
    };
    file.seek(SeekFrom::Start(start))?;

    Ok(match algo {
        HashAlgo::Sha256 => {
            let hasher = feed(Sha256::new(), &mut file, &mut remaining, path)?;
            format!("{:x}", hasher.finalize())
        }
        HashAlgo::Sha512 => {
            let hasher = feed(Sha512::new(), &mut file, &mut remaining, path)?;
            format!("{:x}", hasher.finalize())
        }
    })
}

/// Hash the file from its current position until `remaining` runs out or
/// EOF.
fn feed<D: Digest>(
    mut hasher: D,
    file: &mut File,
    remaining: &mut Option<u64>,
    path: &Path,
) -> Result<D> {
    let mut buf = vec![0u8; CHUNK];
    loop {
        let want = match *remaining {
            Some(0) => break,
            Some(n) => (n as usize).min(CHUNK),
            None => CHUNK,
        };
        let n = file
            .read(&mut buf[..want])
            .with_context(|| format!("Failed to read {} for hashing", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        if let Some(r) = remaining.as_mut() {
            *r -= n as u64;
        }
    }
    Ok(hasher)
}

/// Hex digest of an in-memory buffer.
pub fn bytes_digest(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}
