//! On-disk superblock.
//!
//! Disk layout:
//! [ superblock | free map | root dir inode | data sectors ]
//!
//! `format` computes the superblock once; `mount` reads it back and checks
//! the magic before trusting anything else on the device.

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::Bcache;
use crate::param::{FREE_MAP_START, SECTOR_SIZE, SUPERBLOCK_SECTOR};

const SUPERBLOCK_MAGIC: u32 = 0x4958_4653;

#[repr(C)]
#[derive(Clone, Copy, Debug, AsBytes, FromBytes)]
pub struct Superblock {
    /// Must be `SUPERBLOCK_MAGIC`.
    magic: u32,

    /// Size of the file system (sectors).
    pub sector_count: u32,

    /// Sectors occupied by the free map, starting at `FREE_MAP_START`.
    pub free_map_sectors: u32,

    /// Home sector of the root directory inode.
    pub root_inode_sector: u32,
}

const_assert!(core::mem::size_of::<Superblock>() <= SECTOR_SIZE);

/// Bits (= sectors tracked) per free-map sector.
pub const BITS_PER_SECTOR: u32 = (SECTOR_SIZE * 8) as u32;

impl Superblock {
    /// Compute the layout for a `sector_count`-sector device.
    pub fn new(sector_count: u32) -> Self {
        let free_map_sectors = sector_count.div_ceil(BITS_PER_SECTOR);
        Self {
            magic: SUPERBLOCK_MAGIC,
            sector_count,
            free_map_sectors,
            root_inode_sector: FREE_MAP_START + free_map_sectors,
        }
    }

    /// Read the superblock. Panics on a bad magic: a device without one is
    /// not ours to interpret.
    pub fn load(cache: &Bcache) -> Self {
        let mut sb = Self::new(0);
        cache.read(SUPERBLOCK_SECTOR, sb.as_bytes_mut(), 0);
        assert_eq!(sb.magic, SUPERBLOCK_MAGIC, "invalid file system");
        sb
    }

    pub fn store(&self, cache: &Bcache) {
        cache.write(SUPERBLOCK_SECTOR, self.as_bytes(), 0);
    }

    /// Sectors the layout itself occupies: superblock, map, root inode.
    pub fn reserved_sectors(&self) -> u32 {
        self.root_inode_sector + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_geometry() {
        let sb = Superblock::new(4096);
        assert_eq!(sb.free_map_sectors, 1);
        assert_eq!(sb.root_inode_sector, 2);
        assert_eq!(sb.reserved_sectors(), 3);

        let sb = Superblock::new(4097);
        assert_eq!(sb.free_map_sectors, 2);
        assert_eq!(sb.root_inode_sector, 3);
    }
}
