//! imgcraft library.
//!
//! The binary is a thin CLI over these modules; integration tests use them
//! directly.

pub mod archive;
pub mod bmap;
pub mod bootstrap;
pub mod checksum;
pub mod chroot;
pub mod common;
pub mod config;
pub mod error;
pub mod gpt;
pub mod imager;
pub mod kickstart;
pub mod mount;
pub mod preflight;
pub mod process;
pub mod teardown;
pub mod timing;

pub use error::{Error, FormatError};
