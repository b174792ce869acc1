//! Named shared-memory regions backed by memory-mapped files.
//!
//! Regions are identified by flat names (`<channel>.<topic>.buffer`) that map
//! to files under `/dev/shm` where available, falling back to the system temp
//! directory. All cooperating processes resolve the same name to the same
//! file, so a region created by one process can be opened by any other.

use memmap2::{Mmap, MmapMut};
use std::{
    fs::{File, OpenOptions},
    io,
    path::PathBuf,
};

/// Resolves a region name to its backing file path.
///
/// `/dev/shm` is a tmpfs on Linux, which keeps the mapping memory-resident.
/// On platforms without it the temp directory is used instead.
pub fn region_path(name: &str) -> PathBuf {
    let base = PathBuf::from("/dev/shm");
    if base.is_dir() {
        base.join(name)
    } else {
        std::env::temp_dir().join(name)
    }
}

/// Returns whether a region with the given name currently exists.
pub fn region_exists(name: &str) -> bool {
    region_path(name).is_file()
}

/// Unlinks a named region. Returns `true` if a file was removed.
pub fn remove_region(name: &str) -> bool {
    std::fs::remove_file(region_path(name)).is_ok()
}

pub struct ShmRegionMut {
    /// File handle kept alive to maintain the memory map validity
    _file: File,
    /// Memory-mapped region providing mutable access to the backing file
    mmap: MmapMut,
}

pub struct ShmRegion {
    /// File handle kept alive to maintain the memory map validity
    _file: File,
    /// Memory-mapped region providing read-only access to the backing file
    mmap: Mmap,
}

impl ShmRegionMut {
    /// Create (or truncate) a named region of `len` bytes and map it
    /// read-write. The fresh region reads as all zeros.
    pub fn create(name: &str, len: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(region_path(name))?;
        file.set_len(len)?;

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { _file: file, mmap })
    }

    /// Open an existing named region, or create one of `len` bytes if none
    /// exists. Returns the mapping and whether the region was freshly
    /// created (zeroed, in need of initialization).
    pub fn open_or_create(name: &str, len: u64) -> io::Result<(Self, bool)> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(region_path(name))?;

        let fresh = file.metadata()?.len() == 0;
        if fresh {
            file.set_len(len)?;
        }

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok((Self { _file: file, mmap }, fresh))
    }

    /// Open an existing named region and map it read-write.
    pub fn open(name: &str) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(region_path(name))?;

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { _file: file, mmap })
    }

    /// Return raw pointer to the start of the mapped region
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }
}

impl ShmRegion {
    /// Open an existing named region and map it read-only.
    pub fn open(name: &str) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(region_path(name))?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { _file: file, mmap })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_name(tag: &str) -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("shmbus_mmap_test_{tag}_{}_{ts}", std::process::id())
    }

    #[test]
    fn region_roundtrip_bytes() {
        let name = unique_name("rw");

        {
            let mut rw = ShmRegionMut::create(&name, 4096).unwrap();
            unsafe {
                let p = rw.as_mut_ptr();
                *p.add(0) = 0xAB;
                *p.add(1) = 0xCD;
            }
        }
        {
            let ro = ShmRegion::open(&name).unwrap();
            assert_eq!(ro.len(), 4096);
            unsafe {
                let p = ro.as_ptr();
                assert_eq!(*p.add(0), 0xAB);
                assert_eq!(*p.add(1), 0xCD);
            }
        }

        assert!(remove_region(&name));
        assert!(!region_exists(&name));
    }

    #[test]
    fn open_or_create_reports_freshness() {
        let name = unique_name("fresh");

        let (first, fresh) = ShmRegionMut::open_or_create(&name, 1024).unwrap();
        assert!(fresh);
        assert_eq!(first.len(), 1024);
        drop(first);

        let (second, fresh) = ShmRegionMut::open_or_create(&name, 1024).unwrap();
        assert!(!fresh);
        assert_eq!(second.len(), 1024);
        drop(second);

        remove_region(&name);
    }
}
