//! Native Oberon file-system driver.
//!
//! This crate reads and writes the on-disk file system of Native Oberon
//! inside a raw disk image: it locates the Oberon partition behind the
//! MBR (including extended-partition chains), rebuilds the directory
//! B-tree and the sector reservation map in memory, and offers file-level
//! operations (list, find, create, read, write, remove) on top of the
//! 2048-byte sector abstraction.
//!
//! The on-disk format is left bit-exact: all magic marks, the fixed
//! offsets of every structure, and the legacy ×29 sector-address encoding
//! are preserved, so images modified here remain bootable by the source
//! OS. The persisted free-space bitmap ("map index") is invalidated on
//! open and never written back; free space is always recomputed from the
//! directory.
//!
//! See `struct FileSystem` for the entry point and `src/tests.rs` for
//! usage examples.

mod bitmap;
mod dir;
mod disk;
mod error;
mod file;
mod fs;
mod layout;
mod sector;

#[cfg(test)]
mod tests;

pub use disk::DiskImage;
pub use error::{FsError, Result};
pub use file::File;
pub use fs::FileSystem;
pub use sector::Sector;

/// Smallest I/O unit of the driver.
pub const SECTOR_SIZE: usize = 2048;

/// Oberon sector addresses are the raw 1-based sector number multiplied
/// by 29; divisibility is an integrity check inherited from the source OS.
pub const SECTOR_MULTIPLIER: u32 = 29;

/// Underlying host disk block; 4 blocks form one sector.
pub(crate) const BLOCK_SIZE: usize = 512;
pub(crate) const BLOCKS_PER_SECTOR: u32 = (SECTOR_SIZE / BLOCK_SIZE) as u32;

/// A file spans at most the 64-entry sector table plus 12 index sectors
/// of 512 entries each; one of those sectors is the header itself.
pub(crate) const MAX_FILE_SECTORS: u32 =
    (layout::SEC_TAB_SIZE + layout::EXT_TAB_SIZE * layout::INDEX_SIZE) as u32;

/// Largest representable file, in bytes.
pub const MAX_FILE_SIZE: u32 =
    MAX_FILE_SECTORS * SECTOR_SIZE as u32 - layout::HEADER_SIZE as u32;
