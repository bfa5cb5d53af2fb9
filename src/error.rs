//! File-system errors.
//!
//! Only recoverable conditions appear here. Device I/O failures and corrupt
//! on-disk metadata are unrecoverable and escalate as panics; a write denied
//! by `deny_write` is reported as a zero-byte write, not an error.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The free map could not satisfy an allocation.
    #[error("no free sectors")]
    NoSpace,

    /// No directory entry with the given name.
    #[error("no such file or directory")]
    NotFound,

    /// An entry with the given name already exists.
    #[error("file exists")]
    AlreadyExists,

    /// A non-final path component resolved to a regular file.
    #[error("not a directory")]
    NotADir,

    /// The operation requires a regular file but found a directory.
    #[error("is a directory")]
    IsADir,

    /// Refusing to remove a directory that still has entries.
    #[error("directory not empty")]
    DirNotEmpty,

    /// A path component exceeds `NAME_MAX` bytes.
    #[error("name too long")]
    NameTooLong,

    /// Empty path, empty component, or a reserved name (`.`, `..`).
    #[error("malformed path")]
    BadPath,

    /// The operation would grow a file past the block map's reach.
    #[error("file too large")]
    FileTooLarge,
}
