//! Typed errors for binary formats and OS resources.
//!
//! Parsers and lifecycle primitives return these directly. Orchestration code
//! carries them inside `anyhow::Error`, so callers can still match on them with
//! `err.downcast_ref::<Error>()`.

use std::path::PathBuf;
use thiserror::Error;

/// Malformed or corrupt on-disk structures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("format error: GPT table not found on '{path}'")]
    TableNotFound { path: PathBuf },

    #[error("unsupported GPT revision {found:#010x} (supported: {supported:#010x})")]
    UnsupportedRevision { found: u32, supported: u32 },

    #[error("corrupt GPT header: header size is {found} bytes, expected {expected}")]
    HeaderSize { found: u32, expected: u32 },

    #[error("corrupt GPT header: crc mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    CrcMismatch { stored: u32, computed: u32 },

    #[error("corrupt GPT header: partition entry size {found} is smaller than {minimum}")]
    EntrySize { found: u32, minimum: u32 },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("mount error: {0}")]
    Mount(String),

    #[error("{path} is already in use (locked)")]
    Lock { path: PathBuf },

    #[error("build error: {0}")]
    Build(String),

    #[error("bootstrap error: {0}")]
    Bootstrap(String),
}

impl Error {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_messages_name_both_values() {
        let err = FormatError::UnsupportedRevision {
            found: 0x0002_0000,
            supported: 0x0001_0000,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x00020000"), "{}", msg);
        assert!(msg.contains("0x00010000"), "{}", msg);

        let err = FormatError::HeaderSize {
            found: 96,
            expected: 92,
        };
        assert!(err.to_string().contains("96"));
        assert!(err.to_string().contains("92"));
    }

    #[test]
    fn test_lock_error_names_path() {
        let err = Error::Lock {
            path: PathBuf::from("/srv/root/.chroot.lock"),
        };
        assert!(err.to_string().contains("/srv/root/.chroot.lock"));
    }

    #[test]
    fn test_format_error_converts() {
        let err: Error = FormatError::TableNotFound {
            path: PathBuf::from("disk.img"),
        }
        .into();
        assert!(matches!(err, Error::Format(_)));
        assert!(err.to_string().contains("table not found") || err.to_string().contains("not found"));
    }
}
