//! File system implementation. Five layers:
//!   + Device: synchronous sector I/O behind the `BlockDevice` trait.
//!   + Buffer cache: write-back pool all sector traffic flows through.
//!   + Free map: persistent bitmap handing out sectors.
//!   + Inodes: indexed block maps, extension, deferred deallocation.
//!   + Directories and names: fixed-size entries in ordinary files.
//!
//! `FileSys` ties the layers together: one instance per mounted device,
//! shared by reference between every thread using the volume. Dropping it
//! unmounts: the free map and every dirty cache slot go back to the device.

use std::sync::{Arc, Mutex};

use log::debug;

pub(crate) mod dir;
pub(crate) mod freemap;
pub(crate) mod inode;
pub(crate) mod path;
pub(crate) mod superblock;

use crate::bio::Bcache;
use crate::device::BlockDevice;
use crate::error::Error;
use crate::file::File;
use self::dir::Dir;
use self::freemap::FreeMap;
use self::inode::{Inode, Itable};
use self::superblock::Superblock;

pub struct FileSys {
    pub(crate) cache: Bcache,
    pub(crate) freemap: FreeMap,
    pub(crate) itable: Itable,
    /// Serialises name-space operations (path walks, entry add/remove), so
    /// a directory entry is never observed half-written. File contents are
    /// not under this lock; the cache and per-inode state cover those.
    ns_lock: Mutex<()>,
    sb: Superblock,
}

impl FileSys {
    /// Lay a fresh file system onto `device`: superblock, free map, empty
    /// root directory. Returns the mounted file system.
    pub fn format(device: Arc<dyn BlockDevice>) -> Result<FileSys, Error> {
        let sb = Superblock::new(device.sector_count());
        assert!(
            sb.sector_count > sb.reserved_sectors(),
            "device too small to format"
        );
        let cache = Bcache::new(device);
        let freemap = FreeMap::new(&sb);
        inode::create(&cache, &freemap, sb.root_inode_sector, 0, true)?;

        let fs = FileSys {
            cache,
            freemap,
            itable: Itable::new(),
            ns_lock: Mutex::new(()),
            sb,
        };
        let root = fs.itable.open(sb.root_inode_sector);
        let dir = Dir::new(Arc::clone(&root));
        let seeded = dir
            .add(&fs.cache, &fs.freemap, ".", sb.root_inode_sector)
            .and_then(|()| dir.add(&fs.cache, &fs.freemap, "..", sb.root_inode_sector));
        fs.itable.close(&fs.cache, &fs.freemap, &root);
        seeded?;

        sb.store(&fs.cache);
        fs.freemap.persist(&fs.cache);
        fs.cache.flush();
        debug!(
            "formatted {} sectors, root inode at {}",
            sb.sector_count, sb.root_inode_sector
        );
        Ok(fs)
    }

    /// Mount the file system already on `device`. Panics if the superblock
    /// is missing or corrupt; there is nothing sensible to do with such a
    /// device.
    pub fn mount(device: Arc<dyn BlockDevice>) -> FileSys {
        let sector_count = device.sector_count();
        let cache = Bcache::new(device);
        let sb = Superblock::load(&cache);
        assert!(sb.sector_count <= sector_count, "image larger than device");
        let freemap = FreeMap::load(&cache, &sb);
        debug!("mounted {} sectors", sb.sector_count);
        FileSys {
            cache,
            freemap,
            itable: Itable::new(),
            ns_lock: Mutex::new(()),
            sb,
        }
    }

    /// Create a regular file of initial length `size` bytes.
    pub fn create(&self, path: &str, size: u32) -> Result<(), Error> {
        self.create_entry(path, size, false)
    }

    /// Create a directory, seeded with `.` and `..`.
    pub fn mkdir(&self, path: &str) -> Result<(), Error> {
        self.create_entry(path, 0, true)
    }

    fn create_entry(&self, path: &str, size: u32, is_dir: bool) -> Result<(), Error> {
        let _ns = self.ns_lock.lock().unwrap();
        let (parent, base) = self.resolve_parent(path)?;
        let result = self.create_in(&parent, base, size, is_dir);
        self.itable.close(&self.cache, &self.freemap, &parent);
        result
    }

    fn create_in(
        &self,
        parent: &Arc<Inode>,
        base: &str,
        size: u32,
        is_dir: bool,
    ) -> Result<(), Error> {
        let dir = Dir::new(Arc::clone(parent));
        if dir.lookup(&self.cache, base).is_some() {
            return Err(Error::AlreadyExists);
        }
        let home = self.freemap.allocate(1).ok_or(Error::NoSpace)?;
        if let Err(e) = inode::create(&self.cache, &self.freemap, home, size, is_dir) {
            self.freemap.release(home, 1);
            return Err(e);
        }
        if is_dir {
            let child = self.itable.open(home);
            let child_dir = Dir::new(Arc::clone(&child));
            let seeded = child_dir
                .add(&self.cache, &self.freemap, ".", home)
                .and_then(|()| child_dir.add(&self.cache, &self.freemap, "..", parent.sector()));
            if seeded.is_err() {
                child.remove();
            }
            self.itable.close(&self.cache, &self.freemap, &child);
            seeded?;
        }
        if let Err(e) = dir.add(&self.cache, &self.freemap, base, home) {
            // Undo the orphan through the normal deferred-deallocation path.
            let orphan = self.itable.open(home);
            orphan.remove();
            self.itable.close(&self.cache, &self.freemap, &orphan);
            return Err(e);
        }
        Ok(())
    }

    /// Open a file or directory. A trailing slash (or `/` itself) names a
    /// directory; opening a name that was removed fails with `NotFound`.
    pub fn open(&self, path: &str) -> Result<File<'_>, Error> {
        if path.is_empty() {
            return Err(Error::BadPath);
        }
        let _ns = self.ns_lock.lock().unwrap();
        let inode = self.resolve(path)?;
        Ok(File::new(self, inode))
    }

    /// Unlink `path`. Sector reclamation is deferred until the last open
    /// handle closes; handles already open keep working. Directories must
    /// be empty.
    pub fn remove(&self, path: &str) -> Result<(), Error> {
        let _ns = self.ns_lock.lock().unwrap();
        let (parent, base) = self.resolve_parent(path)?;
        let result = self.remove_in(&parent, base);
        self.itable.close(&self.cache, &self.freemap, &parent);
        result
    }

    fn remove_in(&self, parent: &Arc<Inode>, base: &str) -> Result<(), Error> {
        let dir = Dir::new(Arc::clone(parent));
        let sector = dir.lookup(&self.cache, base).ok_or(Error::NotFound)?;
        let victim = self.itable.open(sector);
        let result = (|| {
            if victim.is_dir(&self.cache) {
                let victim_dir = Dir::new(Arc::clone(&victim));
                if !victim_dir.is_empty(&self.cache) {
                    return Err(Error::DirNotEmpty);
                }
            }
            dir.remove(&self.cache, &self.freemap, base)?;
            victim.remove();
            Ok(())
        })();
        self.itable.close(&self.cache, &self.freemap, &victim);
        result
    }

    /// Names in the directory at `path`, `.` and `..` excluded.
    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, Error> {
        let _ns = self.ns_lock.lock().unwrap();
        let inode = self.resolve(path)?;
        let result = if inode.is_dir(&self.cache) {
            Ok(Dir::new(Arc::clone(&inode)).list(&self.cache))
        } else {
            Err(Error::NotADir)
        };
        self.itable.close(&self.cache, &self.freemap, &inode);
        result
    }

    /// Persist the free map and write every dirty cache slot back.
    pub fn flush(&self) {
        self.freemap.persist(&self.cache);
        self.cache.flush();
    }

    pub fn hit_count(&self) -> u64 {
        self.cache.hit_count()
    }

    pub fn access_count(&self) -> u64 {
        self.cache.access_count()
    }

    pub fn reset_cache_stats(&self) {
        self.cache.reset_stats()
    }

    /// Flush and empty the cache, so the next access of any sector misses.
    pub fn invalidate_cache(&self) {
        self.cache.invalidate()
    }

    /// Sectors the free map currently counts as in use.
    pub fn used_sectors(&self) -> usize {
        self.freemap.used_count()
    }

    /// Walk `path` from the root, returning the final inode opened.
    fn resolve(&self, path: &str) -> Result<Arc<Inode>, Error> {
        let mut cur = self.itable.open(self.sb.root_inode_sector);
        let mut rest = path;
        while let Some((name, after)) = path::skip_elem(rest) {
            rest = after;
            let step = (|| {
                if !cur.is_dir(&self.cache) {
                    return Err(Error::NotADir);
                }
                if name.len() > crate::param::NAME_MAX {
                    return Err(Error::NameTooLong);
                }
                Dir::new(Arc::clone(&cur))
                    .lookup(&self.cache, name)
                    .ok_or(Error::NotFound)
            })();
            match step {
                Ok(next_sector) => {
                    let next = self.itable.open(next_sector);
                    self.itable.close(&self.cache, &self.freemap, &cur);
                    cur = next;
                }
                Err(e) => {
                    self.itable.close(&self.cache, &self.freemap, &cur);
                    return Err(e);
                }
            }
        }
        if path.ends_with('/') && !cur.is_dir(&self.cache) {
            self.itable.close(&self.cache, &self.freemap, &cur);
            return Err(Error::NotADir);
        }
        Ok(cur)
    }

    /// Resolve everything but the final component; return the parent
    /// directory (open) and the component name.
    fn resolve_parent<'p>(&self, path: &'p str) -> Result<(Arc<Inode>, &'p str), Error> {
        let (dir_part, base) = path::split_parent(path)?;
        let parent = self.resolve(dir_part)?;
        if !parent.is_dir(&self.cache) {
            self.itable.close(&self.cache, &self.freemap, &parent);
            return Err(Error::NotADir);
        }
        Ok((parent, base))
    }
}

impl Drop for FileSys {
    fn drop(&mut self) {
        self.flush();
        debug!("unmounted");
    }
}
