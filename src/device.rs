//! Block device adapter.
//!
//! A `BlockDevice` transfers exactly one sector per call, synchronously, and
//! may block the caller. The buffer cache is the only file-system component
//! that performs device I/O; everything above it sees cached sectors.
//!
//! I/O failures have no partial-failure mode: implementations panic, and the
//! cache does not retry.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::param::SECTOR_SIZE;

pub trait BlockDevice: Send + Sync {
    /// Number of sectors the device holds.
    fn sector_count(&self) -> u32;

    /// Read `sector` into `buf`.
    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]);

    /// Write `buf` to `sector`.
    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]);
}

/// Memory-backed disk.
///
/// Keeps per-direction I/O counters so tests can observe how many transfers
/// actually reached the device behind the cache.
pub struct RamDisk {
    data: Mutex<Box<[u8]>>,
    sectors: u32,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RamDisk {
    pub fn new(sectors: u32) -> Self {
        Self {
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE].into_boxed_slice()),
            sectors,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Sectors transferred from the device since creation.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Sectors transferred to the device since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn range(&self, sector: u32) -> std::ops::Range<usize> {
        assert!(sector < self.sectors, "sector {} out of range", sector);
        let start = sector as usize * SECTOR_SIZE;
        start..start + SECTOR_SIZE
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> u32 {
        self.sectors
    }

    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        let range = self.range(sector);
        let data = self.data.lock().unwrap();
        buf.copy_from_slice(&data[range]);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        let range = self.range(sector);
        let mut data = self.data.lock().unwrap();
        data[range].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Disk backed by an ordinary file, so an image survives across mounts.
pub struct FileDisk {
    file: Mutex<File>,
    sectors: u32,
}

impl FileDisk {
    /// Create a zero-filled image of `sectors` sectors at `path`.
    pub fn create(path: &Path, sectors: u32) -> std::io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(sectors as u64 * SECTOR_SIZE as u64)?;
        log::debug!("created {}-sector image at {}", sectors, path.display());
        Ok(Self {
            file: Mutex::new(file),
            sectors,
        })
    }

    /// Open an existing image; its size determines the sector count.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        assert_eq!(len % SECTOR_SIZE as u64, 0, "image not sector-aligned");
        Ok(Self {
            file: Mutex::new(file),
            sectors: (len / SECTOR_SIZE as u64) as u32,
        })
    }
}

impl BlockDevice for FileDisk {
    fn sector_count(&self) -> u32 {
        self.sectors
    }

    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        assert!(sector < self.sectors, "sector {} out of range", sector);
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .and_then(|_| file.read_exact(buf))
            .expect("disk read failed");
    }

    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        assert!(sector < self.sectors, "sector {} out of range", sector);
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .and_then(|_| file.write_all(buf))
            .expect("disk write failed");
    }
}
