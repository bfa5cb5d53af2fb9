//! Free-map: a persistent bitmap over every sector on the device.
//!
//! One bit per sector, set while the sector is in use. The map lives in the
//! reserved sectors right after the superblock and moves through the buffer
//! cache like any other metadata. Double release of a sector is a bug in the
//! caller and panics.

use std::sync::Mutex;

use bit_set::BitSet;
use bit_vec::BitVec;
use log::{debug, trace};

use crate::bio::Bcache;
use crate::fs::superblock::Superblock;
use crate::param::{FREE_MAP_START, SECTOR_SIZE};

pub struct FreeMap {
    inner: Mutex<FreeMapInner>,
}

struct FreeMapInner {
    used: BitSet,
    sector_count: u32,
    map_sectors: u32,
}

impl FreeMap {
    /// Fresh map for a newly formatted device: only the layout's own
    /// sectors (superblock, map, root inode) are marked used.
    pub fn new(sb: &Superblock) -> Self {
        let mut used = BitSet::with_capacity(sb.sector_count as usize);
        for sector in 0..sb.reserved_sectors() {
            used.insert(sector as usize);
        }
        Self {
            inner: Mutex::new(FreeMapInner {
                used,
                sector_count: sb.sector_count,
                map_sectors: sb.free_map_sectors,
            }),
        }
    }

    /// Restore the map persisted by a previous session.
    pub fn load(cache: &Bcache, sb: &Superblock) -> Self {
        let mut bytes = vec![0u8; sb.free_map_sectors as usize * SECTOR_SIZE];
        for (i, chunk) in bytes.chunks_mut(SECTOR_SIZE).enumerate() {
            cache.read(FREE_MAP_START + i as u32, chunk, 0);
        }
        let mut bits = BitVec::from_bytes(&bytes);
        bits.truncate(sb.sector_count as usize);
        let used = BitSet::from_bit_vec(bits);
        debug!(
            "free map loaded: {} of {} sectors in use",
            used.len(),
            sb.sector_count
        );
        Self {
            inner: Mutex::new(FreeMapInner {
                used,
                sector_count: sb.sector_count,
                map_sectors: sb.free_map_sectors,
            }),
        }
    }

    /// Write the map back to its reserved sectors.
    pub fn persist(&self, cache: &Bcache) {
        let inner = self.inner.lock().unwrap();
        let total_bits = inner.map_sectors as usize * SECTOR_SIZE * 8;
        let mut bits = inner.used.get_ref().clone();
        bits.grow(total_bits - bits.len(), false);
        let bytes = bits.to_bytes();
        for (i, chunk) in bytes.chunks(SECTOR_SIZE).enumerate() {
            cache.write(FREE_MAP_START + i as u32, chunk, 0);
        }
        debug!("free map persisted: {} sectors in use", inner.used.len());
    }

    /// Claim `cnt` contiguous sectors, first fit. `None` when no run of
    /// `cnt` free sectors exists.
    pub fn allocate(&self, cnt: u32) -> Option<u32> {
        let cnt = cnt as usize;
        let mut inner = self.inner.lock().unwrap();
        let mut start = 0;
        while start + cnt <= inner.sector_count as usize {
            match (start..start + cnt).find(|&s| inner.used.contains(s)) {
                Some(hit) => start = hit + 1,
                None => {
                    for sector in start..start + cnt {
                        inner.used.insert(sector);
                    }
                    trace!("free map: allocated {} at {}", cnt, start);
                    return Some(start as u32);
                }
            }
        }
        None
    }

    /// Return `cnt` sectors starting at `first` to the pool.
    pub fn release(&self, first: u32, cnt: u32) {
        let mut inner = self.inner.lock().unwrap();
        for sector in first..first + cnt {
            assert!(
                inner.used.remove(sector as usize),
                "releasing free sector {}",
                sector
            );
        }
        trace!("free map: released {} at {}", cnt, first);
    }

    /// Whether `sector` is currently marked in use.
    pub fn is_used(&self, sector: u32) -> bool {
        self.inner.lock().unwrap().used.contains(sector as usize)
    }

    /// Number of sectors currently marked in use.
    pub fn used_count(&self) -> usize {
        self.inner.lock().unwrap().used.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockDevice, RamDisk};
    use crate::param::INVALID_SECTOR;
    use std::sync::Arc;

    fn map_over(sectors: u32) -> (Bcache, FreeMap, Superblock) {
        let disk = Arc::new(RamDisk::new(sectors));
        let cache = Bcache::new(disk as Arc<dyn BlockDevice>);
        let sb = Superblock::new(sectors);
        let map = FreeMap::new(&sb);
        (cache, map, sb)
    }

    #[test]
    fn reserved_sectors_stay_claimed() {
        let (_cache, map, sb) = map_over(256);
        for _ in 0..sb.sector_count {
            let Some(sector) = map.allocate(1) else { break };
            assert!(sector >= sb.reserved_sectors());
            assert_ne!(sector, INVALID_SECTOR);
        }
    }

    #[test]
    fn allocate_release_round_trip() {
        let (_cache, map, _sb) = map_over(64);
        let a = map.allocate(4).unwrap();
        let b = map.allocate(1).unwrap();
        assert!(b == a + 4 || b < a, "first fit left a hole");
        map.release(a, 4);
        let c = map.allocate(4).unwrap();
        assert_eq!(a, c, "released run should be reused first-fit");
    }

    #[test]
    fn exhaustion_reports_none() {
        let (_cache, map, sb) = map_over(16);
        let available = sb.sector_count - sb.reserved_sectors();
        assert!(map.allocate(available).is_some());
        assert!(map.allocate(1).is_none());
    }

    #[test]
    #[should_panic(expected = "releasing free sector")]
    fn double_release_panics() {
        let (_cache, map, _sb) = map_over(64);
        let s = map.allocate(1).unwrap();
        map.release(s, 1);
        map.release(s, 1);
    }

    #[test]
    fn persists_through_cache() {
        let (cache, map, sb) = map_over(256);
        let s = map.allocate(1).unwrap();
        map.persist(&cache);

        let reloaded = FreeMap::load(&cache, &sb);
        assert!(reloaded.is_used(s));
        assert!(!reloaded.is_used(s + 1));
        for sector in 0..sb.reserved_sectors() {
            assert!(reloaded.is_used(sector));
        }
    }
}
