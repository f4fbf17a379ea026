//! GUID Partition Table reader.
//!
//! Reads the primary header at LBA 1 (or the backup copy at the LBA the
//! primary header points to), validates it, and walks the partition entry
//! array lazily. Nothing is cached: every call re-reads the device, so a
//! table rewritten between calls is always seen fresh.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{Error, FormatError, Result};

pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// "EFI PART"
pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

/// Revision 1.0, the only one in use.
pub const GPT_REVISION: u32 = 0x0001_0000;

/// Size of the header structure itself (without the sector padding).
pub const HEADER_SIZE: u32 = 92;

/// Size of the fields every entry carries.
pub const ENTRY_SIZE: u32 = 128;

/// Byte offset of the header CRC field.
const HEADER_CRC_OFFSET: usize = 16;

const NAME_OFFSET: usize = 56;
const NAME_LEN: usize = 72;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub signature: [u8; 8],
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    /// Canonical upper-case UUID text.
    pub disk_uuid: String,
    pub partition_table_lba: u64,
    pub entry_count: u32,
    pub entry_size: u32,
    pub table_crc32: u32,
    /// True for the header at LBA 1, false for the backup copy.
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptEntry {
    /// Slot position in the table (0-based), empty slots included.
    pub index: u32,
    pub type_uuid: String,
    pub part_uuid: String,
    pub first_lba: u64,
    pub last_lba: u64,
    pub flags: u64,
    pub name: String,
    pub primary: bool,
}

impl GptEntry {
    /// Number of sectors covered by the partition.
    pub fn sectors(&self) -> u64 {
        self.last_lba.saturating_sub(self.first_lba) + 1
    }
}

/// Reader bound to one device or image file.
pub struct GptParser {
    path: PathBuf,
    file: File,
    sector_size: u64,
}

impl GptParser {
    /// Open `path` for reading with the default 512-byte sectors.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_sector_size(path, DEFAULT_SECTOR_SIZE)
    }

    pub fn with_sector_size(path: impl AsRef<Path>, sector_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
        Ok(Self {
            path,
            file,
            sector_size,
        })
    }

    /// Byte offset of `lba`, refusing addresses past the end of a 64-bit
    /// file.
    fn lba_offset(&self, lba: u64) -> Result<u64> {
        lba.checked_mul(self.sector_size)
            .ok_or_else(|| self.out_of_range(format!("LBA {} is out of range", lba)))
    }

    fn out_of_range(&self, msg: String) -> Error {
        Error::io(&self.path, io::Error::new(io::ErrorKind::InvalidData, msg))
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::io(&self.path, e))
    }

    /// Read and validate a header. The backup header is located through the
    /// primary header's `backup_lba`.
    pub fn read_header(&self, primary: bool) -> Result<GptHeader> {
        let lba = if primary {
            1
        } else {
            self.read_header(true)?.backup_lba
        };

        let mut raw = [0u8; HEADER_SIZE as usize];
        self.read_at(self.lba_offset(lba)?, &mut raw)?;
        decode_header(&raw, primary, &self.path)
    }

    /// Lazily iterate the non-empty entries of the primary or backup table.
    ///
    /// Each call re-reads the header, so the sequence can be restarted by
    /// calling again.
    pub fn get_partitions(&self, primary: bool) -> Result<Partitions<'_>> {
        let header = self.read_header(primary)?;
        if header.entry_size < ENTRY_SIZE {
            return Err(FormatError::EntrySize {
                found: header.entry_size,
                minimum: ENTRY_SIZE,
            }
            .into());
        }

        Ok(Partitions {
            parser: self,
            offset: self.lba_offset(header.partition_table_lba)?,
            entry_size: header.entry_size as u64,
            count: header.entry_count,
            index: 0,
            primary,
        })
    }
}

/// Iterator over the occupied slots of a partition entry array.
pub struct Partitions<'a> {
    parser: &'a GptParser,
    offset: u64,
    entry_size: u64,
    count: u32,
    index: u32,
    primary: bool,
}

impl Iterator for Partitions<'_> {
    type Item = Result<GptEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.count {
            let index = self.index;
            self.index += 1;
            let offset = match (index as u64)
                .checked_mul(self.entry_size)
                .and_then(|rel| self.offset.checked_add(rel))
            {
                Some(offset) => offset,
                None => {
                    self.index = self.count;
                    return Some(Err(self
                        .parser
                        .out_of_range(format!("partition entry {} is out of range", index))));
                }
            };

            let mut raw = [0u8; ENTRY_SIZE as usize];
            if let Err(e) = self.parser.read_at(offset, &mut raw) {
                // A truncated table ends the sequence after reporting once.
                self.index = self.count;
                return Some(Err(e));
            }

            if let Some(entry) = decode_entry(&raw, index, self.primary) {
                return Some(Ok(entry));
            }
        }
        None
    }
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

/// Render a mixed-endian on-disk GUID as canonical upper-case text.
pub fn stringify_uuid(raw: &[u8]) -> String {
    let mut b = [0u8; 16];
    b.copy_from_slice(&raw[..16]);
    Uuid::from_bytes_le(b).hyphenated().to_string().to_uppercase()
}

/// Decode a UTF-16LE name, cut at the first NUL code unit.
pub fn decode_name(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// CRC32 of a header with its stored-CRC field treated as zero.
pub fn header_crc(raw: &[u8]) -> u32 {
    let mut copy = raw.to_vec();
    copy[HEADER_CRC_OFFSET..HEADER_CRC_OFFSET + 4].fill(0);
    crc32fast::hash(&copy)
}

/// Validate and decode a header. Checks run in a fixed order: signature,
/// revision, declared size, CRC.
fn decode_header(raw: &[u8], primary: bool, path: &Path) -> Result<GptHeader> {
    let mut signature = [0u8; 8];
    signature.copy_from_slice(&raw[0..8]);
    if &signature != GPT_SIGNATURE {
        return Err(FormatError::TableNotFound {
            path: path.to_path_buf(),
        }
        .into());
    }

    let revision = le_u32(raw, 8);
    if revision != GPT_REVISION {
        return Err(FormatError::UnsupportedRevision {
            found: revision,
            supported: GPT_REVISION,
        }
        .into());
    }

    let header_size = le_u32(raw, 12);
    if header_size != HEADER_SIZE {
        return Err(FormatError::HeaderSize {
            found: header_size,
            expected: HEADER_SIZE,
        }
        .into());
    }

    let stored = le_u32(raw, HEADER_CRC_OFFSET);
    let computed = header_crc(raw);
    if stored != computed {
        return Err(FormatError::CrcMismatch { stored, computed }.into());
    }

    Ok(GptHeader {
        signature,
        revision,
        header_size,
        header_crc32: stored,
        current_lba: le_u64(raw, 24),
        backup_lba: le_u64(raw, 32),
        first_usable_lba: le_u64(raw, 40),
        last_usable_lba: le_u64(raw, 48),
        disk_uuid: stringify_uuid(&raw[56..72]),
        partition_table_lba: le_u64(raw, 72),
        entry_count: le_u32(raw, 80),
        entry_size: le_u32(raw, 84),
        table_crc32: le_u32(raw, 88),
        primary,
    })
}

/// Decode one slot; `None` for an empty slot (both LBAs zero).
fn decode_entry(raw: &[u8], index: u32, primary: bool) -> Option<GptEntry> {
    let first_lba = le_u64(raw, 32);
    let last_lba = le_u64(raw, 40);
    if first_lba == 0 && last_lba == 0 {
        return None;
    }

    Some(GptEntry {
        index,
        type_uuid: stringify_uuid(&raw[0..16]),
        part_uuid: stringify_uuid(&raw[16..32]),
        first_lba,
        last_lba,
        flags: le_u64(raw, 48),
        name: decode_name(&raw[NAME_OFFSET..NAME_OFFSET + NAME_LEN]),
        primary,
    })
}

/// Pick the partition an image should be entered through: the one named
/// `root`, else the largest.
pub fn select_root_partition(entries: &[GptEntry]) -> Option<&GptEntry> {
    entries
        .iter()
        .find(|e| e.name.eq_ignore_ascii_case("root"))
        .or_else(|| entries.iter().max_by_key(|e| e.sectors()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stringify_uuid_is_mixed_endian_upper() {
        // EFI System Partition type GUID as stored on disk.
        let raw = [
            0x28, 0x73, 0x2a, 0xc1, 0x1f, 0xf8, 0xd2, 0x11, 0xba, 0x4b, 0x00, 0xa0, 0xc9, 0x3e,
            0xc9, 0x3b,
        ];
        assert_eq!(
            stringify_uuid(&raw),
            "C12A7328-F81F-11D2-BA4B-00A0C93EC93B"
        );
    }

    #[test]
    fn test_decode_name_truncates_at_nul() {
        let mut raw = [0u8; NAME_LEN];
        for (i, c) in "boot".encode_utf16().enumerate() {
            raw[i * 2..i * 2 + 2].copy_from_slice(&c.to_le_bytes());
        }
        // Garbage after the terminator must not leak into the name.
        raw[12] = b'X';
        assert_eq!(decode_name(&raw), "boot");
    }

    #[test]
    fn test_decode_name_full_width() {
        let mut raw = [0u8; NAME_LEN];
        for i in 0..NAME_LEN / 2 {
            raw[i * 2] = b'a';
        }
        assert_eq!(decode_name(&raw).len(), 36);
    }

    #[test]
    fn test_header_crc_ignores_stored_field() {
        let mut raw = [7u8; HEADER_SIZE as usize];
        let a = header_crc(&raw);
        raw[HEADER_CRC_OFFSET..HEADER_CRC_OFFSET + 4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(a, header_crc(&raw));
    }

    #[test]
    fn test_empty_slot_skipped() {
        let raw = [0u8; ENTRY_SIZE as usize];
        assert!(decode_entry(&raw, 3, true).is_none());
    }

    #[test]
    fn test_select_root_partition() {
        let entry = |index, name: &str, first, last| GptEntry {
            index,
            type_uuid: String::new(),
            part_uuid: String::new(),
            first_lba: first,
            last_lba: last,
            flags: 0,
            name: name.to_string(),
            primary: true,
        };
        let entries = vec![entry(0, "efi", 2048, 4095), entry(1, "data", 4096, 99999)];
        assert_eq!(select_root_partition(&entries).unwrap().index, 1);

        let entries = vec![entry(0, "root", 2048, 4095), entry(1, "data", 4096, 99999)];
        assert_eq!(select_root_partition(&entries).unwrap().index, 0);

        assert!(select_root_partition(&[]).is_none());
    }
}
