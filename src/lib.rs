//! An on-disk file system built around two subsystems: a fixed-size
//! write-back buffer cache and an indexed inode layer.
//!
//! The cache sits between the file system and the raw block device,
//! coalescing I/O behind a 64-slot LRU pool whose per-slot readiness
//! protocol lets disk transfers proceed without holding the pool lock. The
//! inode layer builds files and directories on top of it with a
//! direct / single-indirect / doubly-indirect block map, extension on
//! write past end-of-file, reference-counted open inodes, and deferred
//! deallocation of removed inodes at last close.
//!
//! ```no_run
//! use std::sync::Arc;
//! use indexfs::{FileSys, RamDisk};
//!
//! let disk = Arc::new(RamDisk::new(4096));
//! let fs = FileSys::format(disk).unwrap();
//! fs.create("/hello", 0).unwrap();
//! let mut file = fs.open("/hello").unwrap();
//! file.write(b"hello, disk").unwrap();
//! file.seek(0);
//! let mut buf = [0u8; 11];
//! assert_eq!(file.read(&mut buf), 11);
//! ```

pub mod bio;
pub mod device;
pub mod error;
pub mod file;
pub mod fs;
pub mod param;

pub use crate::device::{BlockDevice, FileDisk, RamDisk};
pub use crate::error::Error;
pub use crate::file::File;
pub use crate::fs::FileSys;
