//! Buffer cache.
//!
//! A fixed pool of sector-sized slots holding cached copies of disk sectors.
//! Caching coalesces I/O and provides the synchronization point for sectors
//! shared between threads. Writes are write-back: a dirty slot reaches the
//! device only on eviction or `flush`.
//!
//! Interface:
//! * `read` / `write` copy bytes out of / into the cached image of a sector.
//! * A full-sector `write` is blind: the old contents are never fetched.
//! * `flush` persists every dirty slot; `invalidate` additionally empties
//!   the cache.
//! * `hit_count` / `access_count` expose the slow-path ratio.
//!
//! One mutex guards the whole pool. Disk I/O never happens under it: a slot
//! in transit drops its `ready` flag, the lock is released for the transfer,
//! and waiters block on the slot's condition variable. Threads that want a
//! different sector keep working; threads that want this one (or find every
//! slot busy) sleep until a readiness broadcast.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use array_macro::array;
use log::trace;

use crate::device::BlockDevice;
use crate::param::{INVALID_SECTOR, NBUF, SECTOR_SIZE};

struct BufSlot {
    /// Sector cached here, or `INVALID_SECTOR`.
    sector: u32,
    /// In-memory image is newer than the device sector.
    dirty: bool,
    /// Not currently participating in disk I/O. While false, the slot's
    /// state machine belongs to the thread doing the transfer; everyone
    /// else either waits or picks another slot.
    ready: bool,
    data: [u8; SECTOR_SIZE],
}

impl BufSlot {
    const fn new() -> Self {
        Self {
            sector: INVALID_SECTOR,
            dirty: false,
            ready: true,
            data: [0; SECTOR_SIZE],
        }
    }
}

struct BcacheInner {
    slots: [BufSlot; NBUF],
    /// Slot indices, most-recently-used first.
    lru: Vec<usize>,
    /// Count of slots with `ready == true`.
    num_ready: usize,
    num_accesses: u64,
    num_hits: u64,
}

impl BcacheInner {
    fn new() -> Self {
        Self {
            slots: array![_ => BufSlot::new(); NBUF],
            lru: (0..NBUF).collect(),
            num_ready: NBUF,
            num_accesses: 0,
            num_hits: 0,
        }
    }

    fn find(&self, sector: u32) -> Option<usize> {
        self.slots.iter().position(|slot| slot.sector == sector)
    }

    /// Move `idx` to the LRU front.
    fn touch(&mut self, idx: usize) {
        let pos = self.lru.iter().position(|&i| i == idx).unwrap();
        self.lru.remove(pos);
        self.lru.insert(0, idx);
    }

    /// Rearmost ready slot, or `None` if every slot is busy.
    fn victim(&self) -> Option<usize> {
        self.lru
            .iter()
            .rev()
            .copied()
            .find(|&idx| self.slots[idx].ready)
    }

    #[cfg(debug_assertions)]
    fn check_ready_count(&self) {
        debug_assert_eq!(
            self.num_ready,
            self.slots.iter().filter(|slot| slot.ready).count()
        );
    }

    #[cfg(not(debug_assertions))]
    fn check_ready_count(&self) {}
}

pub struct Bcache {
    device: Arc<dyn BlockDevice>,
    inner: Mutex<BcacheInner>,
    /// Signalled when the matching slot finishes a transfer.
    until_ready: [Condvar; NBUF],
    /// Signalled whenever any slot becomes ready again.
    until_one_ready: Condvar,
}

impl Bcache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            device,
            inner: Mutex::new(BcacheInner::new()),
            until_ready: array![_ => Condvar::new(); NBUF],
            until_one_ready: Condvar::new(),
        }
    }

    /// Copy `dst.len()` bytes out of the cached image of `sector`, starting
    /// at byte `offset` within the sector.
    pub fn read(&self, sector: u32, dst: &mut [u8], offset: usize) {
        assert!(offset + dst.len() <= SECTOR_SIZE);
        let (inner, idx) = self.access(sector, false);
        dst.copy_from_slice(&inner.slots[idx].data[offset..offset + dst.len()]);
    }

    /// Copy `src` into the cached image of `sector` at byte `offset` and
    /// mark the slot dirty. A full-sector write installs the slot without
    /// reading the device first.
    pub fn write(&self, sector: u32, src: &[u8], offset: usize) {
        assert!(offset + src.len() <= SECTOR_SIZE);
        let blind = src.len() == SECTOR_SIZE;
        let (mut inner, idx) = self.access(sector, blind);
        let slot = &mut inner.slots[idx];
        slot.data[offset..offset + src.len()].copy_from_slice(src);
        slot.dirty = true;
    }

    /// Write every dirty slot back to the device. Returns once all of them
    /// have been persisted, including write-backs in flight on other threads.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(idx) = inner
                .slots
                .iter()
                .position(|slot| slot.dirty && slot.ready)
            {
                inner = self.clean(inner, idx);
            } else if let Some(idx) = inner.slots.iter().position(|slot| slot.dirty) {
                inner = self.until_ready[idx].wait(inner).unwrap();
            } else {
                return;
            }
        }
    }

    /// Flush, then forget every cached sector. Test hook: the next access to
    /// any sector is guaranteed to miss.
    pub fn invalidate(&self) {
        self.flush();
        let mut inner = self.inner.lock().unwrap();
        while inner.num_ready < NBUF {
            inner = self.until_one_ready.wait(inner).unwrap();
        }
        for slot in &mut inner.slots {
            debug_assert!(!slot.dirty);
            slot.sector = INVALID_SECTOR;
        }
    }

    pub fn hit_count(&self) -> u64 {
        self.inner.lock().unwrap().num_hits
    }

    pub fn access_count(&self) -> u64 {
        self.inner.lock().unwrap().num_accesses
    }

    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.num_accesses = 0;
        inner.num_hits = 0;
    }

    /// Find or install the slot caching `sector` and return it ready, with
    /// the pool locked. Counts one access per call and one hit only if the
    /// very first scan found the sector present and ready.
    fn access(&self, sector: u32, blind: bool) -> (MutexGuard<'_, BcacheInner>, usize) {
        debug_assert_ne!(sector, INVALID_SECTOR);
        let mut inner = self.inner.lock().unwrap();
        inner.num_accesses += 1;
        let mut is_hit = true;
        loop {
            inner.check_ready_count();
            if let Some(idx) = inner.find(sector) {
                if inner.slots[idx].ready {
                    inner.touch(idx);
                    if is_hit {
                        inner.num_hits += 1;
                    }
                    return (inner, idx);
                }
                // Another thread is faulting this sector in or writing it
                // back; wait for that transfer and rescan.
                is_hit = false;
                inner = self.until_ready[idx].wait(inner).unwrap();
                continue;
            }
            is_hit = false;
            let victim = match inner.victim() {
                Some(idx) => idx,
                None => {
                    inner = self.until_one_ready.wait(inner).unwrap();
                    continue;
                }
            };
            if inner.slots[victim].dirty {
                inner = self.clean(inner, victim);
            } else if blind {
                // Pure overwrite: rename the clean victim in place, no read.
                // The rescan finds it and the caller replaces every byte
                // before the lock is released.
                trace!("bcache: blind steal of slot {} for sector {}", victim, sector);
                inner.slots[victim].sector = sector;
            } else {
                inner = self.replace(inner, victim, sector);
            }
        }
    }

    /// Write the dirty slot `idx` back to the device. The pool lock is
    /// released for the transfer; the slot's cleared `ready` flag keeps
    /// every other thread off it.
    fn clean(
        &self,
        mut inner: MutexGuard<'_, BcacheInner>,
        idx: usize,
    ) -> MutexGuard<'_, BcacheInner> {
        let slot = &mut inner.slots[idx];
        debug_assert!(slot.dirty && slot.ready);
        let sector = slot.sector;
        let data = slot.data;
        slot.ready = false;
        inner.num_ready -= 1;
        drop(inner);

        trace!("bcache: write back sector {}", sector);
        self.device.write(sector, &data);

        let mut inner = self.inner.lock().unwrap();
        let slot = &mut inner.slots[idx];
        slot.dirty = false;
        slot.ready = true;
        inner.num_ready += 1;
        self.until_ready[idx].notify_all();
        self.until_one_ready.notify_all();
        inner
    }

    /// Repoint the clean slot `idx` at `new_sector` and fault the sector in
    /// from the device. The sector field changes before the lock is dropped
    /// so concurrent lookups find the slot and wait on it.
    fn replace(
        &self,
        mut inner: MutexGuard<'_, BcacheInner>,
        idx: usize,
        new_sector: u32,
    ) -> MutexGuard<'_, BcacheInner> {
        let slot = &mut inner.slots[idx];
        debug_assert!(!slot.dirty && slot.ready);
        slot.sector = new_sector;
        slot.ready = false;
        inner.num_ready -= 1;
        drop(inner);

        trace!("bcache: fault in sector {}", new_sector);
        let mut data = [0u8; SECTOR_SIZE];
        self.device.read(new_sector, &mut data);

        let mut inner = self.inner.lock().unwrap();
        let slot = &mut inner.slots[idx];
        slot.data = data;
        slot.ready = true;
        inner.num_ready += 1;
        self.until_ready[idx].notify_all();
        self.until_one_ready.notify_all();
        inner
    }
}
