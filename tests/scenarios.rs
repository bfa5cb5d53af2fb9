//! End-to-end scenarios across the facade, inode layer, and cache.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use indexfs::param::{DIRECT_CNT, INDIRECT_CNT, SECTOR_SIZE};
use indexfs::{BlockDevice, Error, FileDisk, FileSys, RamDisk};

fn fresh_fs(sectors: u32) -> FileSys {
    let _ = env_logger::builder().is_test(true).try_init();
    let disk = Arc::new(RamDisk::new(sectors));
    FileSys::format(disk as Arc<dyn BlockDevice>).unwrap()
}

fn write_sample(fs: &FileSys, path: &str, data: &[u8]) {
    fs.create(path, 0).unwrap();
    let mut file = fs.open(path).unwrap();
    assert_eq!(file.write(data).unwrap(), data.len());
}

#[test]
fn seek_then_reread_is_stable() {
    let fs = fresh_fs(1024);
    write_sample(&fs, "/sample.txt", b"Lorem ipsum dolor sit amet");

    let mut file = fs.open("/sample.txt").unwrap();
    let (mut b1, mut b2) = ([0u8; 2], [0u8; 2]);
    file.seek(5);
    assert_eq!(file.read(&mut b1), 2);
    file.seek(5);
    assert_eq!(file.read(&mut b2), 2);
    assert_eq!(b1, b2);
}

#[test]
fn handles_share_contents_but_not_positions() {
    let fs = fresh_fs(1024);
    write_sample(&fs, "/sample.txt", b"abcdef");

    let mut fd1 = fs.open("/sample.txt").unwrap();
    let mut fd2 = fs.open("/sample.txt").unwrap();
    assert_eq!(fd1.inumber(), fd2.inumber());

    let (mut x, mut y, mut z) = ([0u8; 1], [0u8; 1], [0u8; 1]);
    assert_eq!(fd1.read(&mut x), 1);
    assert_eq!(fd2.read(&mut y), 1);
    assert_eq!(fd1.read(&mut z), 1);
    assert_eq!(x, y, "independent positions");
    assert_ne!(x, z, "fd1 advanced on its own");

    // Writes through one handle are visible through the other.
    fd1.seek(0);
    fd1.write(b"Z").unwrap();
    fd2.seek(0);
    assert_eq!(fd2.read(&mut y), 1);
    assert_eq!(&y, b"Z");
}

#[test]
fn incremental_random_writes_survive_reread() {
    let fs = fresh_fs(1024);
    fs.create("/big", 0).unwrap();
    let mut file = fs.open("/big").unwrap();

    let mut rng = StdRng::seed_from_u64(0x1D5);
    let mut expected = Vec::new();
    for _ in 0..100 {
        let mut chunk = [0u8; 10];
        rng.fill(&mut chunk[..]);
        assert_eq!(file.write(&chunk).unwrap(), 10);
        expected.extend_from_slice(&chunk);
    }
    assert_eq!(file.size(), 1000);

    file.seek(0);
    let mut back = vec![0u8; expected.len()];
    assert_eq!(file.read(&mut back), expected.len());
    assert_eq!(back, expected);
}

#[test]
fn large_file_crosses_indirect_tiers() {
    // Push past both the direct tier and the single-indirect tier, well
    // beyond what the cache can hold at once.
    let fs = fresh_fs(2048);
    fs.create("/deep", 0).unwrap();
    let mut file = fs.open("/deep").unwrap();

    let total = (DIRECT_CNT + INDIRECT_CNT + 8) * SECTOR_SIZE;
    let mut rng = StdRng::seed_from_u64(42);
    let mut expected = vec![0u8; total];
    rng.fill(&mut expected[..]);
    for chunk in expected.chunks(7 * SECTOR_SIZE + 13) {
        assert_eq!(file.write(chunk).unwrap(), chunk.len());
    }
    assert_eq!(file.size() as usize, total);

    file.seek(0);
    let mut back = vec![0u8; total];
    assert_eq!(file.read(&mut back), total);
    assert_eq!(back, expected);
}

#[test]
fn seek_and_tell_laws() {
    let fs = fresh_fs(256);
    fs.create("/laws", 100).unwrap();
    let mut file = fs.open("/laws").unwrap();

    for pos in [0u32, 7, 100, 5000] {
        file.seek(pos);
        assert_eq!(file.tell(), pos);
    }

    // Reading at or past the length returns no bytes.
    let mut buf = [0u8; 16];
    file.seek(100);
    assert_eq!(file.read(&mut buf), 0);
    file.seek(5000);
    assert_eq!(file.read(&mut buf), 0);

    // Writing at a position past the length extends with zeros between.
    file.seek(200);
    assert_eq!(file.write(b"tail").unwrap(), 4);
    assert_eq!(file.size(), 204);
    file.seek(100);
    assert_eq!(file.read(&mut buf), 16);
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn create_fixes_initial_size() {
    let fs = fresh_fs(1024);
    fs.create("/sized", 12345).unwrap();
    let file = fs.open("/sized").unwrap();
    assert_eq!(file.size(), 12345);
}

#[test]
fn removed_file_stays_usable_until_close() {
    let fs = fresh_fs(1024);
    let baseline = fs.used_sectors();

    write_sample(&fs, "/doomed", &[9u8; SECTOR_SIZE * 2]);
    let mut file = fs.open("/doomed").unwrap();
    fs.remove("/doomed").unwrap();

    // Unlinked: the name is gone, the handle is not.
    assert_eq!(fs.open("/doomed").unwrap_err(), Error::NotFound);
    file.seek(SECTOR_SIZE as u32);
    let mut buf = [0u8; 4];
    assert_eq!(file.read(&mut buf), 4);
    assert_eq!(buf, [9u8; 4]);
    assert!(fs.used_sectors() > baseline);

    // Last close reclaims every sector, home included.
    drop(file);
    assert_eq!(fs.used_sectors(), baseline);
}

#[test]
fn deny_write_reports_zero_bytes() {
    let fs = fresh_fs(256);
    write_sample(&fs, "/exe", b"#!image");

    let mut loader = fs.open("/exe").unwrap();
    loader.deny_write();
    let mut other = fs.open("/exe").unwrap();
    assert_eq!(other.write(b"scribble").unwrap(), 0);
    assert_eq!(other.size(), 7);

    loader.allow_write();
    assert_eq!(other.write(b"scribble").unwrap(), 8);
}

#[test]
fn directories_nest_and_resolve() {
    let fs = fresh_fs(1024);
    fs.mkdir("/a").unwrap();
    fs.mkdir("/a/b").unwrap();
    fs.create("/a/b/f", 0).unwrap();

    write_sample(&fs, "/a/b/g", b"nested");
    let mut file = fs.open("/a//b/./g").unwrap();
    let mut buf = [0u8; 6];
    assert_eq!(file.read(&mut buf), 6);
    assert_eq!(&buf, b"nested");

    // Trailing slash opens the directory itself.
    let dir = fs.open("/a/b/").unwrap();
    assert!(dir.is_dir());
    assert_eq!(fs.open("/a/b/g/").unwrap_err(), Error::NotADir);

    let mut names = fs.list_dir("/a/b").unwrap();
    names.sort();
    assert_eq!(names, ["f", "g"]);

    // Dotdot climbs to the parent.
    assert_eq!(
        fs.open("/a/b/../b/g").unwrap().inumber(),
        fs.open("/a/b/g").unwrap().inumber()
    );
}

#[test]
fn directory_removal_requires_emptiness() {
    let fs = fresh_fs(1024);
    let baseline = fs.used_sectors();
    fs.mkdir("/d").unwrap();
    fs.create("/d/f", 0).unwrap();

    assert_eq!(fs.remove("/d").unwrap_err(), Error::DirNotEmpty);
    fs.remove("/d/f").unwrap();
    fs.remove("/d").unwrap();
    assert_eq!(fs.open("/d").unwrap_err(), Error::NotFound);
    assert_eq!(fs.used_sectors(), baseline);

    assert_eq!(fs.remove("/").unwrap_err(), Error::BadPath);
    assert_eq!(fs.remove("/d/..").unwrap_err(), Error::BadPath);
}

#[test]
fn create_errors() {
    let fs = fresh_fs(256);
    fs.create("/f", 0).unwrap();
    assert_eq!(fs.create("/f", 0).unwrap_err(), Error::AlreadyExists);
    assert_eq!(fs.create("/missing/f", 0).unwrap_err(), Error::NotFound);
    assert_eq!(fs.create("/f/g", 0).unwrap_err(), Error::NotADir);
    assert_eq!(
        fs.create(&format!("/{}", "n".repeat(64)), 0).unwrap_err(),
        Error::NameTooLong
    );
    assert_eq!(fs.create("", 0).unwrap_err(), Error::BadPath);
}

#[test]
fn allocation_exhaustion_has_no_partial_effects() {
    let fs = fresh_fs(64);
    let baseline = fs.used_sectors();
    assert_eq!(
        fs.create("/huge", 64 * SECTOR_SIZE as u32).unwrap_err(),
        Error::NoSpace
    );
    assert_eq!(fs.used_sectors(), baseline);
    assert_eq!(fs.open("/huge").unwrap_err(), Error::NotFound);

    // The volume still works after the failure.
    fs.create("/small", SECTOR_SIZE as u32).unwrap();
}

#[test]
fn image_survives_a_mount_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("fs.img");

    let payload: Vec<u8> = (0..SECTOR_SIZE * 3).map(|i| (i % 251) as u8).collect();
    {
        let disk = Arc::new(FileDisk::create(&image, 1024).unwrap());
        let fs = FileSys::format(disk as Arc<dyn BlockDevice>).unwrap();
        fs.mkdir("/boot").unwrap();
        write_sample(&fs, "/boot/kernel", &payload);
        // Dropping the file system flushes the cache and free map.
    }

    let disk = Arc::new(FileDisk::open(&image).unwrap());
    let fs = FileSys::mount(disk as Arc<dyn BlockDevice>);
    let mut file = fs.open("/boot/kernel").unwrap();
    assert_eq!(file.size() as usize, payload.len());
    let mut back = vec![0u8; payload.len()];
    assert_eq!(file.read(&mut back), payload.len());
    assert_eq!(back, payload);

    // Allocation state survived too: new files land on free sectors only.
    fs.create("/boot/initrd", SECTOR_SIZE as u32).unwrap();
    let mut file = fs.open("/boot/kernel").unwrap();
    assert_eq!(file.read(&mut back), payload.len());
    assert_eq!(back, payload);
}

#[test]
fn parallel_files_do_not_interfere() {
    let fs = fresh_fs(4096);
    std::thread::scope(|scope| {
        for t in 0..8u32 {
            let fs = &fs;
            scope.spawn(move || {
                let path = format!("/worker{}", t);
                fs.create(&path, 0).unwrap();
                let mut file = fs.open(&path).unwrap();
                let pattern = [t as u8; 1024];
                for _ in 0..16 {
                    assert_eq!(file.write(&pattern).unwrap(), pattern.len());
                }
                file.seek(0);
                let mut back = [0u8; 1024];
                for _ in 0..16 {
                    assert_eq!(file.read(&mut back), back.len());
                    assert!(back.iter().all(|&b| b == t as u8));
                }
            });
        }
    });
    assert!(fs.hit_count() <= fs.access_count());
    assert_eq!(fs.list_dir("/").unwrap().len(), 8);
}

#[test]
fn concurrent_extension_and_readers() {
    let fs = fresh_fs(4096);
    fs.create("/growing", 0).unwrap();

    std::thread::scope(|scope| {
        let fs = &fs;
        scope.spawn(move || {
            let mut writer = fs.open("/growing").unwrap();
            for i in 0..64u32 {
                assert_eq!(
                    writer.write(&[i as u8; SECTOR_SIZE]).unwrap(),
                    SECTOR_SIZE
                );
            }
        });
        for _ in 0..3 {
            scope.spawn(move || {
                let mut reader = fs.open("/growing").unwrap();
                for _ in 0..200 {
                    reader.seek(0);
                    let size = reader.size();
                    let mut buf = vec![0u8; size as usize];
                    let n = reader.read(&mut buf);
                    // A reader may race the extension, but every byte below
                    // the length it read must carry its sector's fill
                    // pattern or still be zero.
                    for (off, &b) in buf[..n].iter().enumerate() {
                        let sector = off / SECTOR_SIZE;
                        assert!(
                            b == sector as u8 || b == 0,
                            "byte {} was {} in a {}-byte file",
                            off,
                            b,
                            n
                        );
                    }
                }
            });
        }
    });

    let mut file = fs.open("/growing").unwrap();
    assert_eq!(file.size(), 64 * SECTOR_SIZE as u32);
    let mut buf = vec![0u8; SECTOR_SIZE];
    for i in 0..64usize {
        file.seek((i * SECTOR_SIZE) as u32);
        assert_eq!(file.read(&mut buf), SECTOR_SIZE);
        assert!(buf.iter().all(|&b| b == i as u8));
    }
}
