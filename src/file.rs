//! File handles.
//!
//! A `File` pairs an open inode with a position of its own. Two handles on
//! the same path share one inode (and so one contents state) but seek and
//! read independently. Dropping the handle is the close: the last close of
//! a removed file is what actually frees its sectors.

use core::fmt;
use std::sync::Arc;

use crate::error::Error;
use crate::fs::inode::Inode;
use crate::fs::FileSys;

pub struct File<'fs> {
    fs: &'fs FileSys,
    inode: Arc<Inode>,
    pos: u32,
    denied: bool,
}

impl<'fs> File<'fs> {
    pub(crate) fn new(fs: &'fs FileSys, inode: Arc<Inode>) -> Self {
        Self {
            fs,
            inode,
            pos: 0,
            denied: false,
        }
    }

    /// Read up to `dst.len()` bytes at the current position, advancing it.
    /// Short (or zero) at end-of-file.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.inode.read_at(&self.fs.cache, dst, self.pos);
        self.pos += n as u32;
        n
    }

    /// Write `src` at the current position, extending the file as needed.
    /// Returns the bytes written; 0 when writes are denied. Directories
    /// cannot be written through a handle.
    pub fn write(&mut self, src: &[u8]) -> Result<usize, Error> {
        if self.is_dir() {
            return Err(Error::IsADir);
        }
        let n = self
            .inode
            .write_at(&self.fs.cache, &self.fs.freemap, src, self.pos)?;
        self.pos += n as u32;
        Ok(n)
    }

    /// Set the position. Seeking past end-of-file is allowed; reads there
    /// return 0 bytes and a write there extends the file.
    pub fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }

    /// Current position.
    pub fn tell(&self) -> u32 {
        self.pos
    }

    /// Current length of the underlying inode.
    pub fn size(&self) -> u32 {
        self.inode.length(&self.fs.cache)
    }

    /// Home sector of the underlying inode.
    pub fn inumber(&self) -> u32 {
        self.inode.sector()
    }

    pub fn is_dir(&self) -> bool {
        self.inode.is_dir(&self.fs.cache)
    }

    /// Forbid writes to the underlying inode through every handle, as the
    /// process loader does for a running executable's image. Idempotent per
    /// handle; undone by `allow_write` or by dropping the handle.
    pub fn deny_write(&mut self) {
        if !self.denied {
            self.inode.deny_write();
            self.denied = true;
        }
    }

    pub fn allow_write(&mut self) {
        if self.denied {
            self.inode.allow_write();
            self.denied = false;
        }
    }
}

impl fmt::Debug for File<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("inumber", &self.inode.sector())
            .field("pos", &self.pos)
            .finish()
    }
}

impl Drop for File<'_> {
    fn drop(&mut self) {
        if self.denied {
            self.inode.allow_write();
        }
        self.fs
            .itable
            .close(&self.fs.cache, &self.fs.freemap, &self.inode);
    }
}
