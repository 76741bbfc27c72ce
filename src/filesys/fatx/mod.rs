//! FATX cluster-chain engine
//!
//! [`Fatx`] ties one mounted volume together: the FAT accessor and
//! allocator ([`FatTable`]), the resident inodes with their chain caches,
//! and the directory lookups the file-handle code needs.

use crate::constants::fatx::*;
use crate::filesys::{BlockDevice, BlockStore, FatxError};
use alloc::sync::Arc;
use alloc::vec;
use core::ops::ControlFlow;
use log::{error, info};
use spin::Mutex;

pub mod allocator;
pub mod cache;
pub mod dir_entry;
pub mod fat_entry;
pub mod geometry;
pub mod inode;
pub mod nfs;
pub mod table;

pub use cache::{ChainCache, ChainPos};
pub use dir_entry::DirEntry;
pub use fat_entry::{FatEntry, FatWidth};
pub use geometry::{Geometry, MountOptions, NfsMode};
pub use inode::{FatxInode, InodeTable, ROOT_INO};
pub use nfs::{EntryId, FidType, FileId};
pub use table::{FatCursor, FatTable};

/// Physical extent returned by [`Fatx::bmap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMap {
    /// Device block backing the requested file block
    pub phys: u64,
    /// Blocks from `phys` onwards that are contiguous within the cluster
    pub mapped_blocks: u64,
}

/// A mounted FATX volume
pub struct Fatx {
    store: Arc<dyn BlockStore>,
    geometry: Geometry,
    options: MountOptions,
    fat: FatTable,
    inodes: InodeTable,
    root: Arc<FatxInode>,
    /// Serializes rebuilding inodes from handles
    build_lock: Mutex<()>,
}

impl Fatx {
    /// Lays down empty FATs and an empty root directory
    pub fn format<D: BlockDevice>(device: &mut D, geometry: &Geometry) -> Result<(), FatxError> {
        geometry.validate()?;
        let block_size = geometry.block_size;
        if device.block_size() != block_size {
            return Err(FatxError::InvalidGeometry);
        }
        let width = geometry.width;
        let zero_block = vec![0u8; block_size];

        // Entries 0 and 1 are reserved: media descriptor, then end of chain
        let mut fat_block = vec![0u8; block_size];
        put_raw(width, &mut fat_block, 0, (0xFFFF_FF00 | MEDIA_FIXED_DISK as u32) & width.mask());
        put_raw(width, &mut fat_block, 1, width.eof_value());
        if width == FatWidth::Fat32 {
            put_raw(width, &mut fat_block, geometry.root_cluster, width.eof_value());
        }

        for i in 0..geometry.fats as u64 {
            let fat_start = geometry.fat_start + i * geometry.fat_length;
            device.write_block(fat_start, &fat_block)?;
            for j in 1..geometry.fat_length {
                device.write_block(fat_start + j, &zero_block)?;
            }
        }

        // Initialize empty root directory
        if width == FatWidth::Fat32 {
            let first = geometry.clus_to_blknr(geometry.root_cluster);
            for i in 0..geometry.sec_per_clus as u64 {
                device.write_block(first + i, &zero_block)?;
            }
        } else {
            for i in 0..geometry.root_dir_blocks() {
                device.write_block(geometry.dir_start + i, &zero_block)?;
            }
        }
        Ok(())
    }

    pub fn mount(
        store: Arc<dyn BlockStore>,
        geometry: Geometry,
        options: MountOptions,
    ) -> Result<Self, FatxError> {
        geometry.validate()?;
        if store.block_size() != geometry.block_size {
            error!(
                "FATX-fs: block size mismatch ({} != {})",
                store.block_size(),
                geometry.block_size
            );
            return Err(FatxError::InvalidGeometry);
        }

        let inodes = InodeTable::new();
        let root = Arc::new(FatxInode::new(
            ROOT_INO,
            None,
            0,
            ATTR_DIR,
            geometry.root_cluster,
        ));
        inodes.attach(&root);

        info!(
            "FATX: mounted {}-bit volume, {} clusters of {} bytes",
            geometry.width.bits(),
            geometry.max_cluster - FATX_START_ENT,
            geometry.cluster_size()
        );

        let fs = Self {
            fat: FatTable::new(store.clone(), geometry, &options),
            store,
            geometry,
            options,
            inodes,
            root,
            build_lock: Mutex::new(()),
        };
        if fs.has_fixed_root(&fs.root) {
            let size = geometry.dir_entries as u64 * DIR_ENTRY_SIZE as u64;
            fs.root.set_size(size);
            fs.root.set_alloc_size(size);
        } else {
            fs.calc_dir_size(&fs.root)?;
        }
        Ok(fs)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn fat(&self) -> &FatTable {
        &self.fat
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    pub fn root(&self) -> &Arc<FatxInode> {
        &self.root
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Reports a corruption error, at most a burst per window
    pub(crate) fn fs_error_ratelimit(&self, err: FatxError, inode: &FatxInode) -> FatxError {
        if self.fat.ratelimit().allow() {
            error!(
                "FATX-fs error: {} (i_pos {:?}, start {})",
                err,
                inode.pos(),
                inode.start()
            );
        }
        err
    }

    /// Resident directory whose first cluster is `start`; 0 is the root
    pub fn dget(&self, start: u32) -> Option<Arc<FatxInode>> {
        if start == 0 {
            return Some(self.root.clone());
        }
        self.inodes.dget(start)
    }

    pub fn iget(&self, pos: u64) -> Option<Arc<FatxInode>> {
        self.inodes.iget(pos)
    }

    /// Returns the resident inode for `pos`, or builds one from `de`
    pub fn build_inode(&self, de: &DirEntry, pos: u64) -> Result<Arc<FatxInode>, FatxError> {
        self.build_inode_with(de, pos, None)
    }

    pub(crate) fn build_inode_with(
        &self,
        de: &DirEntry,
        pos: u64,
        generation: Option<u32>,
    ) -> Result<Arc<FatxInode>, FatxError> {
        let _guard = self.build_lock.lock();
        if let Some(inode) = self.inodes.iget(pos) {
            return Ok(inode);
        }

        let generation = generation
            .filter(|&g| g != 0)
            .unwrap_or_else(|| self.inodes.next_generation());
        let inode = Arc::new(FatxInode::from_dir_entry(
            self.inodes.alloc_ino(),
            generation,
            de,
            Some(pos),
            &self.geometry,
        ));
        if inode.is_dir() && inode.start() != 0 {
            self.calc_dir_size(&inode)?;
        }
        self.inodes.attach(&inode);
        Ok(inode)
    }

    /// Sizes a directory from the length of its cluster chain
    fn calc_dir_size(&self, inode: &FatxInode) -> Result<(), FatxError> {
        let fcluster = match self.get_cluster(inode, u32::MAX)? {
            ChainPos::EndOfChain { fcluster, .. } => fcluster,
            ChainPos::Mapped { .. } => {
                return Err(self.fs_error_ratelimit(FatxError::ChainLoop, inode));
            }
        };
        let size = (fcluster as u64 + 1) * self.geometry.cluster_size() as u64;
        inode.set_size(size);
        inode.set_alloc_size(size);
        Ok(())
    }

    /// Drops `inode` from the resident set
    pub fn evict_inode(&self, inode: &Arc<FatxInode>) {
        self.inodes.detach(inode);
    }

    /// Reads the directory entry at byte position `pos`
    pub fn read_dir_entry(&self, pos: u64) -> Result<DirEntry, FatxError> {
        let (blocknr, slot) = self.entry_location(pos)?;
        let bh = self.store.bread(blocknr)?;
        let data = bh.data();
        let offset = slot * DIR_ENTRY_SIZE;
        Ok(DirEntry::parse(&data[offset..offset + DIR_ENTRY_SIZE]))
    }

    /// Writes `inode`'s start cluster and size back to its directory entry
    pub fn write_inode(&self, inode: &FatxInode) -> Result<(), FatxError> {
        let Some(pos) = inode.pos() else {
            return Ok(());
        };
        let (blocknr, slot) = self.entry_location(pos)?;
        let bh = self.store.bread(blocknr)?;
        {
            let mut data = bh.data_mut();
            let raw = &mut data[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE];
            let mut de = DirEntry::parse(raw);
            de.set_start(inode.start());
            if !inode.is_dir() {
                de.size = inode.size() as u32;
            }
            de.write(raw);
        }
        bh.mark_dirty();
        if self.options.sync {
            self.store.sync_buffer(&bh)?;
        }
        Ok(())
    }

    fn entry_location(&self, pos: u64) -> Result<(u64, usize), FatxError> {
        let (blocknr, slot) = self.geometry.pos_to_blknr_slot(pos)?;
        let data_end = self.geometry.clus_to_blknr(self.geometry.max_cluster);
        if blocknr < self.geometry.dir_start || blocknr >= data_end {
            return Err(FatxError::InvalidPosition(pos));
        }
        Ok((blocknr, slot))
    }

    fn has_fixed_root(&self, dir: &FatxInode) -> bool {
        dir.ino() == ROOT_INO && self.geometry.dir_entries != 0
    }

    /// Visits every live entry of `dir` in order until `f` breaks
    ///
    /// Stops early at the end-of-directory marker.
    pub fn scan_dir<T>(
        &self,
        dir: &FatxInode,
        mut f: impl FnMut(&DirEntry, u64) -> ControlFlow<T>,
    ) -> Result<Option<T>, FatxError> {
        if self.has_fixed_root(dir) {
            let first = self.geometry.dir_start;
            for blocknr in first..first + self.geometry.root_dir_blocks() {
                if let ControlFlow::Break(found) = self.scan_block(blocknr, &mut f)? {
                    return Ok(found);
                }
            }
            return Ok(None);
        }

        let mut cluster = 0;
        loop {
            let dclus = match self.get_cluster(dir, cluster)? {
                ChainPos::Mapped { dcluster, .. } => dcluster,
                ChainPos::EndOfChain { .. } => return Ok(None),
            };
            let first = self.geometry.clus_to_blknr(dclus);
            for blocknr in first..first + self.geometry.sec_per_clus as u64 {
                if let ControlFlow::Break(found) = self.scan_block(blocknr, &mut f)? {
                    return Ok(found);
                }
            }
            cluster += 1;
        }
    }

    /// `Break(Some)` when `f` breaks, `Break(None)` at the end marker
    fn scan_block<T>(
        &self,
        blocknr: u64,
        f: &mut impl FnMut(&DirEntry, u64) -> ControlFlow<T>,
    ) -> Result<ControlFlow<Option<T>>, FatxError> {
        let bh = self.store.bread(blocknr)?;
        let data = bh.data();
        for (slot, raw) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
            let de = DirEntry::parse(raw);
            if de.is_end() {
                return Ok(ControlFlow::Break(None));
            }
            if de.is_deleted() {
                continue;
            }
            if let ControlFlow::Break(found) = f(&de, self.geometry.entry_pos(blocknr, slot)) {
                return Ok(ControlFlow::Break(Some(found)));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Finds the entry in `dir` whose first cluster is `logstart`
    pub fn scan_logstart(
        &self,
        dir: &FatxInode,
        logstart: u32,
    ) -> Result<Option<(DirEntry, u64)>, FatxError> {
        let width = self.geometry.width;
        self.scan_dir(dir, |de, pos| {
            if !de.is_dot_entry() && de.start(width) == logstart {
                ControlFlow::Break((*de, pos))
            } else {
                ControlFlow::Continue(())
            }
        })
    }

    /// Returns the `..` entry of `dir`
    pub fn get_dotdot_entry(&self, dir: &FatxInode) -> Result<(DirEntry, u64), FatxError> {
        self.scan_dir(dir, |de, pos| {
            if &de.name == MSDOS_DOTDOT {
                ControlFlow::Break((*de, pos))
            } else {
                ControlFlow::Continue(())
            }
        })?
        .ok_or(FatxError::NotFound)
    }

    /// Maps file block `sector` of `inode` to a device block
    ///
    /// Blocks past the file size are only mapped when `create` is set and
    /// they fall inside already allocated clusters.
    pub fn bmap(
        &self,
        inode: &FatxInode,
        sector: u64,
        create: bool,
    ) -> Result<Option<BlockMap>, FatxError> {
        let g = &self.geometry;
        if self.has_fixed_root(inode) {
            if sector < g.root_dir_blocks() {
                return Ok(Some(BlockMap {
                    phys: g.dir_start + sector,
                    mapped_blocks: 1,
                }));
            }
            return Ok(None);
        }

        let block_size = g.block_size as u64;
        let mut last_block = inode.size().div_ceil(block_size);
        if sector >= last_block {
            if !create {
                return Ok(None);
            }
            last_block = inode.alloc_size().div_ceil(block_size);
            if sector >= last_block {
                return Ok(None);
            }
        }

        let spc = g.sec_per_clus as u64;
        let cluster = (sector / spc) as u32;
        let offset = sector % spc;
        let Some(dclus) = self.bmap_cluster(inode, cluster)? else {
            return Ok(None);
        };

        Ok(Some(BlockMap {
            phys: g.clus_to_blknr(dclus) + offset,
            mapped_blocks: (spc - offset).min(last_block - sector),
        }))
    }

    fn bmap_cluster(&self, inode: &FatxInode, cluster: u32) -> Result<Option<u32>, FatxError> {
        if inode.start() == 0 {
            return Ok(None);
        }
        match self.get_cluster(inode, cluster)? {
            ChainPos::Mapped { dcluster, .. } => Ok(Some(dcluster)),
            ChainPos::EndOfChain { .. } => {
                Err(self.fs_error_ratelimit(FatxError::BeyondEof, inode))
            }
        }
    }

    /// Appends the chain starting at `new_dclus` (`nr_cluster` long) to `inode`
    pub fn chain_add(
        &self,
        inode: &Arc<FatxInode>,
        new_dclus: u32,
        nr_cluster: u32,
    ) -> Result<(), FatxError> {
        let cluster_size = self.geometry.cluster_size() as u64;
        let new_fclus = if inode.start() != 0 {
            let (fcluster, last) = match self.get_cluster(inode, u32::MAX)? {
                ChainPos::EndOfChain { fcluster, dcluster } => (fcluster, dcluster),
                ChainPos::Mapped { .. } => {
                    return Err(self.fs_error_ratelimit(FatxError::ChainLoop, inode));
                }
            };
            self.fat
                .set(last, FatEntry::Used(new_dclus), self.options.sync)?;
            fcluster + 1
        } else {
            inode.set_start(new_dclus);
            self.write_inode(inode)?;
            self.inodes.attach(inode);
            0
        };

        let expected = (inode.alloc_size() / cluster_size) as u32;
        if new_fclus != expected {
            if self.fat.ratelimit().allow() {
                error!(
                    "FATX-fs error: clusters badly computed ({} != {})",
                    new_fclus, expected
                );
            }
            inode.cache().invalidate();
        }
        let alloc_size = (new_fclus + nr_cluster) as u64 * cluster_size;
        inode.set_alloc_size(alloc_size);
        if inode.is_dir() {
            inode.set_size(alloc_size);
        }
        Ok(())
    }

    /// Allocates `count` clusters and appends them to `inode`
    pub fn alloc_clusters(&self, inode: &Arc<FatxInode>, count: usize) -> Result<u32, FatxError> {
        let clusters = self.fat.allocate(count)?;
        let Some(&first) = clusters.first() else {
            return Err(FatxError::InsufficientSpace);
        };
        if let Err(err) = self.chain_add(inode, first, clusters.len() as u32) {
            if let Err(rollback) = self.fat.free(first) {
                error!("FATX-fs error: failed to release clusters at {}: {}", first, rollback);
            }
            return Err(err);
        }
        Ok(first)
    }

    /// Keeps the first `skip` clusters of `inode` and frees the rest
    pub fn truncate_chain(&self, inode: &Arc<FatxInode>, skip: u32) -> Result<(), FatxError> {
        let start = inode.start();
        if start == 0 {
            return Ok(());
        }

        inode.cache().invalidate();
        let free_start = if skip > 0 {
            let dclus = match self.get_cluster(inode, skip - 1)? {
                ChainPos::Mapped { dcluster, .. } => dcluster,
                // chain already shorter than `skip`
                ChainPos::EndOfChain { .. } => return Ok(()),
            };
            match self.fat.get(dclus)? {
                FatEntry::Used(next) => {
                    self.fat.set(dclus, FatEntry::Eof, self.options.sync)?;
                    next
                }
                FatEntry::Eof | FatEntry::Bad => return Ok(()),
                FatEntry::Free => {
                    return Err(self.fs_error_ratelimit(FatxError::BrokenChain, inode));
                }
            }
        } else {
            if inode.is_dir() {
                self.inodes.detach_dir(start);
            }
            inode.set_start(0);
            start
        };

        let cluster_size = self.geometry.cluster_size() as u64;
        let kept = skip as u64 * cluster_size;
        inode.set_alloc_size(inode.alloc_size().min(kept));
        inode.set_size(inode.size().min(kept));
        self.write_inode(inode)?;

        self.fat.free(free_start)
    }

    /// Frees every cluster of `inode`
    pub fn release_chain(&self, inode: &Arc<FatxInode>) -> Result<(), FatxError> {
        self.truncate_chain(inode, 0)
    }
}

/// Stores a raw value for `entry` into the first block of a FAT image
fn put_raw(width: FatWidth, block: &mut [u8], entry: u32, raw: u32) {
    let offset = width.byte_offset(entry) as usize;
    match width {
        FatWidth::Fat12 => {
            let (lo, hi) = block.split_at_mut(offset + 1);
            fat_entry::put12(entry, raw, &mut lo[offset], &mut hi[0]);
        }
        FatWidth::Fat16 => {
            block[offset..offset + 2].copy_from_slice(&(raw as u16).to_le_bytes());
        }
        FatWidth::Fat32 => {
            block[offset..offset + 4].copy_from_slice(&raw.to_le_bytes());
        }
    }
}
