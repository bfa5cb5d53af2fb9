//! Directories.
//!
//! A directory is an inode whose contents are an array of fixed-size
//! entries, read and written through the ordinary inode path. Every
//! directory carries `.` and `..` entries; removal of anything else leaves
//! a reusable hole rather than compacting the file.

use std::sync::Arc;

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::Bcache;
use crate::error::Error;
use crate::fs::freemap::FreeMap;
use crate::fs::inode::Inode;
use crate::param::{INVALID_SECTOR, NAME_MAX};

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct DirEntry {
    /// Home sector of the entry's inode.
    inode_sector: u32,
    /// Non-zero while the slot holds a live entry.
    in_use: u8,
    name_len: u8,
    name: [u8; NAME_MAX],
}

pub(crate) const DIR_ENTRY_SIZE: usize = core::mem::size_of::<DirEntry>();
const_assert_eq!(DIR_ENTRY_SIZE, 36);

impl DirEntry {
    fn free_slot() -> Self {
        Self {
            inode_sector: INVALID_SECTOR,
            in_use: 0,
            name_len: 0,
            name: [0; NAME_MAX],
        }
    }

    fn filled(name: &str, inode_sector: u32) -> Self {
        debug_assert!(!name.is_empty() && name.len() <= NAME_MAX);
        let mut entry = Self::free_slot();
        entry.inode_sector = inode_sector;
        entry.in_use = 1;
        entry.name_len = name.len() as u8;
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry
    }

    fn name(&self) -> &str {
        let len = (self.name_len as usize).min(NAME_MAX);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

/// A view of an open inode as a directory. The caller is responsible for
/// only wrapping inodes whose `is_dir` flag is set.
pub(crate) struct Dir {
    inode: Arc<Inode>,
}

impl Dir {
    pub(crate) fn new(inode: Arc<Inode>) -> Self {
        Self { inode }
    }

    fn entry_at(&self, cache: &Bcache, index: usize) -> Option<DirEntry> {
        let mut entry = DirEntry::free_slot();
        let offset = (index * DIR_ENTRY_SIZE) as u32;
        let n = self.inode.read_at(cache, entry.as_bytes_mut(), offset);
        (n == DIR_ENTRY_SIZE).then_some(entry)
    }

    fn write_entry(
        &self,
        cache: &Bcache,
        freemap: &FreeMap,
        index: usize,
        entry: &DirEntry,
    ) -> Result<(), Error> {
        let offset = (index * DIR_ENTRY_SIZE) as u32;
        let n = self.inode.write_at(cache, freemap, entry.as_bytes(), offset)?;
        if n != DIR_ENTRY_SIZE {
            // A short write here means deny_write on a directory inode,
            // which nothing in the crate does.
            return Err(Error::NoSpace);
        }
        Ok(())
    }

    fn find(&self, cache: &Bcache, name: &str) -> Option<(usize, DirEntry)> {
        (0..)
            .map_while(|index| self.entry_at(cache, index).map(|e| (index, e)))
            .find(|(_, entry)| entry.in_use != 0 && entry.name() == name)
    }

    /// Home sector of the entry called `name`, if present.
    pub(crate) fn lookup(&self, cache: &Bcache, name: &str) -> Option<u32> {
        self.find(cache, name).map(|(_, entry)| entry.inode_sector)
    }

    /// Add an entry, reusing the first free slot or growing the file.
    pub(crate) fn add(
        &self,
        cache: &Bcache,
        freemap: &FreeMap,
        name: &str,
        inode_sector: u32,
    ) -> Result<(), Error> {
        if self.find(cache, name).is_some() {
            return Err(Error::AlreadyExists);
        }
        let slot = (0..)
            .map_while(|index| self.entry_at(cache, index).map(|e| (index, e)))
            .find(|(_, entry)| entry.in_use == 0)
            .map(|(index, _)| index)
            .unwrap_or(self.inode.length(cache) as usize / DIR_ENTRY_SIZE);
        self.write_entry(cache, freemap, slot, &DirEntry::filled(name, inode_sector))
    }

    /// Drop the entry called `name`, returning its home sector.
    pub(crate) fn remove(
        &self,
        cache: &Bcache,
        freemap: &FreeMap,
        name: &str,
    ) -> Result<u32, Error> {
        let (index, entry) = self.find(cache, name).ok_or(Error::NotFound)?;
        self.write_entry(cache, freemap, index, &DirEntry::free_slot())?;
        Ok(entry.inode_sector)
    }

    /// Whether the directory holds nothing besides `.` and `..`.
    pub(crate) fn is_empty(&self, cache: &Bcache) -> bool {
        !(0..)
            .map_while(|index| self.entry_at(cache, index))
            .any(|entry| entry.in_use != 0 && entry.name() != "." && entry.name() != "..")
    }

    /// Names of the live entries, `.` and `..` excluded.
    pub(crate) fn list(&self, cache: &Bcache) -> Vec<String> {
        (0..)
            .map_while(|index| self.entry_at(cache, index))
            .filter(|entry| entry.in_use != 0)
            .map(|entry| entry.name().to_string())
            .filter(|name| name != "." && name != "..")
            .collect()
    }
}
