//! In-core inodes and the registry of resident ones
//!
//! Inodes are keyed by the position of their directory entry so a file
//! handle can find a resident inode without touching the disk. Directories
//! are also keyed by their first cluster, which is what a child's `..`
//! entry records.

use super::cache::ChainCache;
use super::dir_entry::DirEntry;
use super::geometry::Geometry;
use crate::constants::fatx::ATTR_DIR;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

/// Inode number of the root directory
pub const ROOT_INO: u64 = 1;

pub struct FatxInode {
    ino: u64,
    /// Byte position of the directory entry; `None` for the root and for
    /// placeholders that were never looked up
    pos: Option<u64>,
    generation: u32,
    attr: u8,
    start: AtomicU32,
    size: AtomicU64,
    /// Bytes covered by allocated clusters
    alloc_size: AtomicU64,
    cache: ChainCache,
}

impl FatxInode {
    pub fn new(ino: u64, pos: Option<u64>, generation: u32, attr: u8, start: u32) -> Self {
        Self {
            ino,
            pos,
            generation,
            attr,
            start: AtomicU32::new(start),
            size: AtomicU64::new(0),
            alloc_size: AtomicU64::new(0),
            cache: ChainCache::new(),
        }
    }

    /// Builds an inode from its directory entry
    pub fn from_dir_entry(
        ino: u64,
        generation: u32,
        de: &DirEntry,
        pos: Option<u64>,
        geometry: &Geometry,
    ) -> Self {
        let inode = Self::new(ino, pos, generation, de.attr, de.start(geometry.width));
        if !de.is_directory() {
            let cluster_size = geometry.cluster_size() as u64;
            let size = de.size as u64;
            inode.size.store(size, Ordering::Relaxed);
            inode
                .alloc_size
                .store(size.div_ceil(cluster_size) * cluster_size, Ordering::Relaxed);
        }
        inode
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn pos(&self) -> Option<u64> {
        self.pos
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIR != 0
    }

    /// First cluster, 0 for an inode with no clusters
    pub fn start(&self) -> u32 {
        self.start.load(Ordering::Acquire)
    }

    pub fn set_start(&self, cluster: u32) {
        self.start.store(cluster, Ordering::Release);
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    pub fn alloc_size(&self) -> u64 {
        self.alloc_size.load(Ordering::Acquire)
    }

    pub fn set_alloc_size(&self, size: u64) {
        self.alloc_size.store(size, Ordering::Release);
    }

    pub fn cache(&self) -> &ChainCache {
        &self.cache
    }
}

/// Resident inodes, by entry position and by directory start cluster
pub struct InodeTable {
    by_pos: Mutex<BTreeMap<u64, Arc<FatxInode>>>,
    dirs: Mutex<BTreeMap<u32, Arc<FatxInode>>>,
    next_ino: AtomicU64,
    next_generation: AtomicU32,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub const fn new() -> Self {
        Self {
            by_pos: Mutex::new(BTreeMap::new()),
            dirs: Mutex::new(BTreeMap::new()),
            next_ino: AtomicU64::new(ROOT_INO + 1),
            next_generation: AtomicU32::new(1),
        }
    }

    pub fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::Relaxed)
    }

    /// Next generation number; never 0, which handles use as a wildcard
    pub fn next_generation(&self) -> u32 {
        loop {
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            if generation != 0 {
                return generation;
            }
        }
    }

    /// Makes `inode` findable by position and, for directories, by start
    pub fn attach(&self, inode: &Arc<FatxInode>) {
        if let Some(pos) = inode.pos() {
            self.by_pos.lock().insert(pos, inode.clone());
        }
        if inode.is_dir() && inode.start() != 0 {
            self.dirs.lock().insert(inode.start(), inode.clone());
        }
    }

    /// Forgets `inode`, leaving entries that were replaced by another inode
    pub fn detach(&self, inode: &Arc<FatxInode>) {
        if let Some(pos) = inode.pos() {
            let mut by_pos = self.by_pos.lock();
            if by_pos.get(&pos).is_some_and(|held| Arc::ptr_eq(held, inode)) {
                by_pos.remove(&pos);
            }
        }
        let mut dirs = self.dirs.lock();
        dirs.retain(|_, held| !Arc::ptr_eq(held, inode));
    }

    /// Forgets the directory registered under first cluster `start`
    pub fn detach_dir(&self, start: u32) {
        self.dirs.lock().remove(&start);
    }

    pub fn iget(&self, pos: u64) -> Option<Arc<FatxInode>> {
        self.by_pos.lock().get(&pos).cloned()
    }

    /// Resident directory whose first cluster is `start`
    pub fn dget(&self, start: u32) -> Option<Arc<FatxInode>> {
        self.dirs.lock().get(&start).cloned()
    }

    pub fn resident(&self) -> usize {
        self.by_pos.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesys::fatx::fat_entry::FatWidth;

    #[test]
    fn test_attach_and_lookup() {
        let table = InodeTable::new();
        let dir = Arc::new(FatxInode::new(table.alloc_ino(), Some(4096), 1, ATTR_DIR, 9));
        let file = Arc::new(FatxInode::new(table.alloc_ino(), Some(4128), 2, 0, 12));
        table.attach(&dir);
        table.attach(&file);

        assert!(Arc::ptr_eq(&table.iget(4096).unwrap(), &dir));
        assert!(Arc::ptr_eq(&table.dget(9).unwrap(), &dir));
        assert!(table.dget(12).is_none());
        assert_eq!(table.resident(), 2);

        table.detach(&dir);
        assert!(table.iget(4096).is_none());
        assert!(table.dget(9).is_none());
    }

    #[test]
    fn test_detach_keeps_replacement() {
        let table = InodeTable::new();
        let old = Arc::new(FatxInode::new(2, Some(64), 1, 0, 0));
        let new = Arc::new(FatxInode::new(3, Some(64), 2, 0, 0));
        table.attach(&old);
        table.attach(&new);
        table.detach(&old);
        assert!(Arc::ptr_eq(&table.iget(64).unwrap(), &new));
    }

    #[test]
    fn test_from_dir_entry_rounds_alloc_size() {
        let g = crate::filesys::fatx::table::tests::geometry(FatWidth::Fat16, 100, 1);
        let mut de = DirEntry::new_file("A", "BIN", 7);
        de.size = 700;

        let inode = FatxInode::from_dir_entry(5, 3, &de, Some(32), &g);
        assert_eq!(inode.start(), 7);
        assert_eq!(inode.size(), 700);
        assert_eq!(inode.alloc_size(), 1024);
        assert!(!inode.is_dir());
    }

    #[test]
    fn test_generation_is_never_zero() {
        let table = InodeTable::new();
        table.next_generation.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(table.next_generation(), u32::MAX);
        assert_eq!(table.next_generation(), 1);
    }
}
