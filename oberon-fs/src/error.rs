//! Error type shared by every layer of the driver.

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, FsError>;

/// Everything that can go wrong between the image file and the caller.
///
/// I/O failures keep the underlying error verbatim; structural problems
/// carry a diagnostic naming the offending sector or structure. Neither
/// is ever silently repaired.
#[derive(Debug)]
pub enum FsError {
    /// The host refused or short-changed a read/write.
    Io(io::Error),
    /// On-disk structures are inconsistent: bad mark, directory cycle,
    /// missing index sector, impossible lengths.
    Corrupted(String),
    /// A sector address is not a multiple of 29 or lies outside the
    /// partition.
    InvalidSectorAddress(u32),
    /// A file name violates the Oberon naming rules.
    InvalidFileName(String),
    /// A directory entry with this name already exists.
    AlreadyExists(String),
    /// No directory entry with this name.
    NotFound(String),
    /// The reservation map has no free sector left.
    DiskFull,
    /// The file would exceed the two-level index (64 + 12 × 512 sectors).
    FileTooLarge,
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        FsError::Io(err)
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::Io(err) => write!(f, "i/o error: {err}"),
            FsError::Corrupted(what) => write!(f, "corrupted file system: {what}"),
            FsError::InvalidSectorAddress(addr) => {
                write!(f, "invalid sector address {addr}")
            }
            FsError::InvalidFileName(name) => write!(f, "invalid file name {name:?}"),
            FsError::AlreadyExists(name) => write!(f, "file {name:?} already exists"),
            FsError::NotFound(name) => write!(f, "file {name:?} not found"),
            FsError::DiskFull => write!(f, "disk full"),
            FsError::FileTooLarge => write!(f, "file too large"),
        }
    }
}

impl std::error::Error for FsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FsError::Io(err) => Some(err),
            _ => None,
        }
    }
}
