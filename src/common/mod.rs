//! Shared filesystem helpers.

pub mod files;
pub mod temp;

pub use files::{copy_file_with_dirs, copy_tree, write_file_with_dirs};
pub use temp::ScratchDir;
