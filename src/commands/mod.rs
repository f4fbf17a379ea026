//! CLI command handlers.
//!
//! Each submodule handles one CLI command:
//! - `create` - Build disk images from a kickstart file
//! - `chroot` - Enter a root directory or image file
//! - `gpt` - Print a GPT partition table
//! - `bmap` - Generate a block map
//! - `show` - Display information
//! - `preflight` - Run preflight checks

mod bmap;
mod chroot;
pub mod create;
mod gpt;
mod preflight;
mod show;

pub use bmap::cmd_bmap;
pub use chroot::cmd_chroot;
pub use create::{cmd_create, CreateArgs};
pub use gpt::cmd_gpt;
pub use preflight::cmd_preflight;
pub use show::{cmd_show, ShowTarget};
