//! Inodes.
//!
//! An inode describes a single unnamed file or directory. Its on-disk
//! record occupies exactly one sector, the inode's *home sector*, which also
//! serves as its stable identifier. The record maps file bytes to data
//! sectors through three tiers: 123 direct pointers, one single-indirect
//! sector of 128 pointers, and one doubly-indirect sector whose 128 entries
//! each name another 128-pointer sector.
//!
//! The in-memory `Inode` carries only coordination state; length and the
//! block map always come from the record, read through the buffer cache, so
//! the cache stays the single synchronization point for on-disk bytes.
//!
//! Lifecycle: the first `Itable::open` of a home sector creates the
//! in-memory inode; later opens of the same sector return the same object
//! with its reference count bumped, which is what makes the write-deny
//! counter meaningful. `Itable::close` drops a reference; the last close of
//! an inode whose `removed` flag is set returns every data and indirect
//! sector, plus the home sector itself, to the free map.
//!
//! Extension: a write past end-of-file allocates the missing sectors, then
//! rewrites the record. At most one thread extends an inode at a time, and
//! the inode is marked `extending` for the duration; readers wait out that
//! state before sampling the length, so they observe either the old length
//! or the fully extended one, never a half-built block map.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, trace};
use scopeguard::{guard, ScopeGuard};
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::Bcache;
use crate::error::Error;
use crate::fs::freemap::FreeMap;
use crate::param::{
    DIRECT_CNT, INDIRECT_CNT, INVALID_SECTOR, MAX_FILE_SIZE, PTRS_PER_SECTOR, SECTOR_SIZE,
};

const INODE_MAGIC: u32 = 0x494E_4F44;

const ZERO_SECTOR: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];

/// On-disk inode record. Field order is observable on disk and fixed.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub(crate) struct DiskInode {
    /// Direct data-sector pointers; `INVALID_SECTOR` while unallocated.
    direct: [u32; DIRECT_CNT],
    /// Sector holding 128 data-sector pointers.
    s_indirect: u32,
    /// Sector holding 128 pointers to single-indirect sectors.
    d_indirect: u32,
    /// Directory flag, 32 bits wide on disk.
    is_dir: u32,
    /// File length in bytes.
    length: i32,
    /// Must be `INODE_MAGIC`.
    magic: u32,
}

const_assert_eq!(core::mem::size_of::<DiskInode>(), SECTOR_SIZE);

/// One sector's worth of sector pointers.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct IndirectBlock {
    ptrs: [u32; PTRS_PER_SECTOR],
}

const_assert_eq!(core::mem::size_of::<IndirectBlock>(), SECTOR_SIZE);

impl DiskInode {
    fn new(is_dir: bool) -> Self {
        Self {
            direct: [INVALID_SECTOR; DIRECT_CNT],
            s_indirect: INVALID_SECTOR,
            d_indirect: INVALID_SECTOR,
            is_dir: is_dir as u32,
            length: 0,
            magic: INODE_MAGIC,
        }
    }

    /// Read the record in `sector` through the cache. A bad magic means the
    /// sector does not hold an inode; the file system cannot continue.
    fn load(cache: &Bcache, sector: u32) -> Self {
        let mut dnode = Self::new(false);
        cache.read(sector, dnode.as_bytes_mut(), 0);
        assert_eq!(
            dnode.magic, INODE_MAGIC,
            "sector {} is not an inode",
            sector
        );
        dnode
    }

    fn store(&self, cache: &Bcache, sector: u32) {
        cache.write(sector, self.as_bytes(), 0);
    }
}

impl IndirectBlock {
    fn empty() -> Self {
        Self {
            ptrs: [INVALID_SECTOR; PTRS_PER_SECTOR],
        }
    }

    fn load(cache: &Bcache, sector: u32) -> Self {
        debug_assert_ne!(sector, INVALID_SECTOR);
        let mut block = Self::empty();
        cache.read(sector, block.as_bytes_mut(), 0);
        block
    }

    fn store(&self, cache: &Bcache, sector: u32) {
        cache.write(sector, self.as_bytes(), 0);
    }
}

/// Write a fresh inode record into its home sector. All data sectors for
/// `length` bytes are allocated and zero-filled up front; on any allocation
/// failure nothing is written and every claimed sector is returned.
pub(crate) fn create(
    cache: &Bcache,
    freemap: &FreeMap,
    sector: u32,
    length: u32,
    is_dir: bool,
) -> Result<(), Error> {
    if length as usize > MAX_FILE_SIZE {
        return Err(Error::FileTooLarge);
    }
    let mut dnode = DiskInode::new(is_dir);
    extend(cache, freemap, &mut dnode, length)?;
    dnode.length = length as i32;
    dnode.store(cache, sector);
    trace!("inode {}: created, {} bytes", sector, length);
    Ok(())
}

/// Grow `dnode`'s block map to cover `new_length` bytes.
///
/// Walks the three tiers in order, claiming one sector at a time from the
/// free map and zero-filling each new data sector with a blind full-sector
/// write. Indirect sectors are assembled in memory and persisted only once
/// every allocation has succeeded, so a failed call leaves nothing on disk
/// pointing at a sector it also released.
///
/// On `Err` the caller must discard `dnode`: the in-memory copy may name
/// sectors that were rolled back.
fn extend(
    cache: &Bcache,
    freemap: &FreeMap,
    dnode: &mut DiskInode,
    new_length: u32,
) -> Result<(), Error> {
    debug_assert!(new_length as usize <= MAX_FILE_SIZE);
    let target = (new_length as usize).div_ceil(SECTOR_SIZE);

    // Sectors claimed by this call; drained back to the free map on failure.
    let mut claimed = guard(Vec::new(), |sectors: Vec<u32>| {
        debug!("extend failed, rolling back {} sectors", sectors.len());
        for sector in sectors {
            freemap.release(sector, 1);
        }
    });
    let mut claim = |claimed: &mut Vec<u32>| -> Result<u32, Error> {
        let sector = freemap.allocate(1).ok_or(Error::NoSpace)?;
        claimed.push(sector);
        Ok(sector)
    };
    // Indirect sectors to persist once the whole allocation has succeeded.
    let mut pending: Vec<(u32, IndirectBlock)> = Vec::new();

    for slot in dnode.direct.iter_mut().take(target) {
        if *slot == INVALID_SECTOR {
            let sector = claim(&mut claimed)?;
            cache.write(sector, &ZERO_SECTOR, 0);
            *slot = sector;
        }
    }

    if target > DIRECT_CNT {
        let wanted = (target - DIRECT_CNT).min(INDIRECT_CNT);
        let (mut block, mut dirty) = if dnode.s_indirect == INVALID_SECTOR {
            dnode.s_indirect = claim(&mut claimed)?;
            (IndirectBlock::empty(), true)
        } else {
            (IndirectBlock::load(cache, dnode.s_indirect), false)
        };
        for slot in block.ptrs.iter_mut().take(wanted) {
            if *slot == INVALID_SECTOR {
                let sector = claim(&mut claimed)?;
                cache.write(sector, &ZERO_SECTOR, 0);
                *slot = sector;
                dirty = true;
            }
        }
        if dirty {
            pending.push((dnode.s_indirect, block));
        }
    }

    if target > DIRECT_CNT + INDIRECT_CNT {
        let wanted = target - DIRECT_CNT - INDIRECT_CNT;
        let (mut outer, mut outer_dirty) = if dnode.d_indirect == INVALID_SECTOR {
            dnode.d_indirect = claim(&mut claimed)?;
            (IndirectBlock::empty(), true)
        } else {
            (IndirectBlock::load(cache, dnode.d_indirect), false)
        };
        for group in 0..wanted.div_ceil(PTRS_PER_SECTOR) {
            let in_group = (wanted - group * PTRS_PER_SECTOR).min(PTRS_PER_SECTOR);
            let (mut inner, mut inner_dirty) = if outer.ptrs[group] == INVALID_SECTOR {
                outer.ptrs[group] = claim(&mut claimed)?;
                outer_dirty = true;
                (IndirectBlock::empty(), true)
            } else {
                (IndirectBlock::load(cache, outer.ptrs[group]), false)
            };
            for slot in inner.ptrs.iter_mut().take(in_group) {
                if *slot == INVALID_SECTOR {
                    let sector = claim(&mut claimed)?;
                    cache.write(sector, &ZERO_SECTOR, 0);
                    *slot = sector;
                    inner_dirty = true;
                }
            }
            if inner_dirty {
                pending.push((outer.ptrs[group], inner));
            }
        }
        if outer_dirty {
            pending.push((dnode.d_indirect, outer));
        }
    }

    for (sector, block) in pending {
        block.store(cache, sector);
    }
    ScopeGuard::into_inner(claimed);
    Ok(())
}

/// Mirror of the allocator: return every reachable data sector plus every
/// indirect sector to the free map. The home sector is the caller's.
fn release_contents(cache: &Bcache, freemap: &FreeMap, dnode: &DiskInode) {
    for &sector in dnode.direct.iter().filter(|&&s| s != INVALID_SECTOR) {
        freemap.release(sector, 1);
    }
    if dnode.s_indirect != INVALID_SECTOR {
        let block = IndirectBlock::load(cache, dnode.s_indirect);
        for &sector in block.ptrs.iter().filter(|&&s| s != INVALID_SECTOR) {
            freemap.release(sector, 1);
        }
        freemap.release(dnode.s_indirect, 1);
    }
    if dnode.d_indirect != INVALID_SECTOR {
        let outer = IndirectBlock::load(cache, dnode.d_indirect);
        for &inner_sector in outer.ptrs.iter().filter(|&&s| s != INVALID_SECTOR) {
            let inner = IndirectBlock::load(cache, inner_sector);
            for &sector in inner.ptrs.iter().filter(|&&s| s != INVALID_SECTOR) {
                freemap.release(sector, 1);
            }
            freemap.release(inner_sector, 1);
        }
        freemap.release(dnode.d_indirect, 1);
    }
}

struct InodeState {
    open_cnt: u32,
    deny_write_cnt: u32,
    removed: bool,
    /// A writer is growing the file and rewriting the record.
    extending: bool,
    /// Writers currently inside `write_at`.
    writers: u32,
}

/// An open inode. Obtained from `Itable::open`; one object exists per home
/// sector no matter how many times it is opened.
pub(crate) struct Inode {
    sector: u32,
    state: Mutex<InodeState>,
    until_not_extending: Condvar,
    until_no_writers: Condvar,
}

impl Inode {
    /// Home sector, the inode's stable identifier.
    pub(crate) fn sector(&self) -> u32 {
        self.sector
    }

    pub(crate) fn length(&self, cache: &Bcache) -> u32 {
        DiskInode::load(cache, self.sector).length as u32
    }

    pub(crate) fn is_dir(&self, cache: &Bcache) -> bool {
        DiskInode::load(cache, self.sector).is_dir != 0
    }

    /// Mark for deallocation at last close.
    pub(crate) fn remove(&self) {
        self.state.lock().unwrap().removed = true;
    }

    /// Data sector owning byte `offset`, or `None` at or past end-of-file.
    pub(crate) fn byte_to_sector(&self, cache: &Bcache, offset: u32) -> Option<u32> {
        let dnode = DiskInode::load(cache, self.sector);
        if (offset as i64) >= dnode.length as i64 {
            return None;
        }
        let index = offset as usize / SECTOR_SIZE;
        let sector = if index < DIRECT_CNT {
            dnode.direct[index]
        } else if index < DIRECT_CNT + INDIRECT_CNT {
            let block = IndirectBlock::load(cache, dnode.s_indirect);
            block.ptrs[index - DIRECT_CNT]
        } else {
            let index = index - DIRECT_CNT - INDIRECT_CNT;
            let outer = IndirectBlock::load(cache, dnode.d_indirect);
            let inner = IndirectBlock::load(cache, outer.ptrs[index / PTRS_PER_SECTOR]);
            inner.ptrs[index % PTRS_PER_SECTOR]
        };
        debug_assert_ne!(sector, INVALID_SECTOR, "hole inside file length");
        Some(sector)
    }

    /// Read up to `dst.len()` bytes starting at byte `offset`. Returns the
    /// bytes copied, short at end-of-file.
    pub(crate) fn read_at(&self, cache: &Bcache, dst: &mut [u8], offset: u32) -> usize {
        {
            let mut state = self.state.lock().unwrap();
            while state.extending {
                state = self.until_not_extending.wait(state).unwrap();
            }
        }
        let length = self.length(cache);
        let mut total = 0;
        let mut pos = offset;
        while total < dst.len() && pos < length {
            let sector = match self.byte_to_sector(cache, pos) {
                Some(sector) => sector,
                None => break,
            };
            let sector_ofs = pos as usize % SECTOR_SIZE;
            let chunk = (dst.len() - total)
                .min((length - pos) as usize)
                .min(SECTOR_SIZE - sector_ofs);
            cache.read(sector, &mut dst[total..total + chunk], sector_ofs);
            total += chunk;
            pos += chunk as u32;
        }
        total
    }

    /// Write `src` at byte `offset`, extending the file when the write ends
    /// past the current length. Returns the bytes written: 0 when writes
    /// are denied, `Err` when the extension cannot be allocated.
    pub(crate) fn write_at(
        &self,
        cache: &Bcache,
        freemap: &FreeMap,
        src: &[u8],
        offset: u32,
    ) -> Result<usize, Error> {
        if src.is_empty() {
            return Ok(0);
        }
        let end = (offset as usize)
            .checked_add(src.len())
            .filter(|&end| end <= MAX_FILE_SIZE)
            .ok_or(Error::FileTooLarge)? as u32;
        {
            let mut state = self.state.lock().unwrap();
            if state.deny_write_cnt > 0 {
                return Ok(0);
            }
            state.writers += 1;
        }
        let _writer = guard((), |()| {
            let mut state = self.state.lock().unwrap();
            state.writers -= 1;
            if state.writers == 0 {
                self.until_no_writers.notify_all();
            }
        });

        if end > self.length(cache) {
            self.extend_to(cache, freemap, end)?;
        }

        let length = self.length(cache);
        let mut total = 0;
        let mut pos = offset;
        while total < src.len() && pos < length {
            let sector = match self.byte_to_sector(cache, pos) {
                Some(sector) => sector,
                None => break,
            };
            let sector_ofs = pos as usize % SECTOR_SIZE;
            let chunk = (src.len() - total)
                .min((length - pos) as usize)
                .min(SECTOR_SIZE - sector_ofs);
            cache.write(sector, &src[total..total + chunk], sector_ofs);
            total += chunk;
            pos += chunk as u32;
        }
        Ok(total)
    }

    /// Grow the file to `end` bytes. One extender at a time; the inode lock
    /// is released around the allocation and record flush, with `extending`
    /// standing in for it so readers know to wait.
    fn extend_to(&self, cache: &Bcache, freemap: &FreeMap, end: u32) -> Result<(), Error> {
        {
            let mut state = self.state.lock().unwrap();
            while state.extending {
                state = self.until_not_extending.wait(state).unwrap();
            }
            state.extending = true;
        }
        let result = (|| {
            let mut dnode = DiskInode::load(cache, self.sector);
            // A previous extender may already have grown past us.
            if end as i32 > dnode.length {
                extend(cache, freemap, &mut dnode, end)?;
                dnode.length = end as i32;
                dnode.store(cache, self.sector);
                trace!("inode {}: extended to {} bytes", self.sector, end);
            }
            Ok(())
        })();
        self.state.lock().unwrap().extending = false;
        self.until_not_extending.notify_all();
        result
    }

    /// Forbid writes through any handle until a matching `allow_write`.
    /// Waits for writers already inside `write_at` to drain first.
    pub(crate) fn deny_write(&self) {
        let mut state = self.state.lock().unwrap();
        state.deny_write_cnt += 1;
        debug_assert!(state.deny_write_cnt <= state.open_cnt);
        while state.writers > 0 {
            state = self.until_no_writers.wait(state).unwrap();
        }
    }

    pub(crate) fn allow_write(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.deny_write_cnt > 0, "allow_write without deny_write");
        state.deny_write_cnt -= 1;
    }
}

/// Open-inode table: home sector to in-memory inode. Guarantees the "same
/// inode open twice means the same object" invariant.
pub(crate) struct Itable {
    inodes: Mutex<BTreeMap<u32, Arc<Inode>>>,
}

impl Itable {
    pub(crate) fn new() -> Self {
        Self {
            inodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Open the inode whose record lives in `sector`, reusing the in-memory
    /// object if some other opener already holds it.
    pub(crate) fn open(&self, sector: u32) -> Arc<Inode> {
        let mut inodes = self.inodes.lock().unwrap();
        if let Some(inode) = inodes.get(&sector) {
            inode.state.lock().unwrap().open_cnt += 1;
            return Arc::clone(inode);
        }
        let inode = Arc::new(Inode {
            sector,
            state: Mutex::new(InodeState {
                open_cnt: 1,
                deny_write_cnt: 0,
                removed: false,
                extending: false,
                writers: 0,
            }),
            until_not_extending: Condvar::new(),
            until_no_writers: Condvar::new(),
        });
        inodes.insert(sector, Arc::clone(&inode));
        inode
    }

    /// Drop one reference. The last close of a removed inode frees its
    /// entire extent map and home sector.
    pub(crate) fn close(&self, cache: &Bcache, freemap: &FreeMap, inode: &Arc<Inode>) {
        let mut inodes = self.inodes.lock().unwrap();
        let mut state = inode.state.lock().unwrap();
        state.open_cnt -= 1;
        if state.open_cnt > 0 {
            return;
        }
        let removed = state.removed;
        inodes.remove(&inode.sector);
        drop(state);
        drop(inodes);
        if removed {
            debug!("inode {}: freeing on last close", inode.sector);
            let dnode = DiskInode::load(cache, inode.sector);
            release_contents(cache, freemap, &dnode);
            freemap.release(inode.sector, 1);
        }
    }

    /// Number of inodes currently open.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inodes.lock().unwrap().len()
    }
}
