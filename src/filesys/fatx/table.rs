//! FAT entry accessor
//!
//! Entries are read and written through a [`FatCursor`], which keeps the one
//! or two blocks holding the current entry loaded so consecutive accesses in
//! the same block skip the block store. Only 12-bit entries can straddle a
//! block boundary; 16- and 32-bit entries are naturally aligned.

use super::fat_entry::{get12, put12, FatEntry, FatWidth};
use super::geometry::{Geometry, MountOptions};
use crate::constants::fatx::{FATX_START_ENT, RATELIMIT_BURST, RATELIMIT_INTERVAL};
use crate::filesys::{sync_buffers, BlockStore, BufferRef, FatxError};
use crate::logging::RateLimit;
use alloc::sync::Arc;
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use log::error;
use spin::{Mutex, MutexGuard};

/// Position in the FAT plus the blocks backing it
#[derive(Clone, Default)]
pub struct FatCursor {
    entry: u32,
    /// Byte offset of the entry's first byte in `bhs[0]`
    offset: usize,
    bhs: ArrayVec<BufferRef, 2>,
}

impl FatCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the entry the cursor points at
    pub fn entry(&self) -> u32 {
        self.entry
    }

    pub fn buffers(&self) -> &[BufferRef] {
        &self.bhs
    }

    /// Drops the loaded blocks
    pub fn release(&mut self) {
        self.bhs.clear();
    }

    fn set_entry(&mut self, entry: u32) {
        self.entry = entry;
    }
}

/// Allocation state, guarded by the table lock
pub(super) struct AllocState {
    /// Last allocated cluster; scans resume after it
    pub(super) prev_free: u32,
    /// Free-cluster count, `None` when unknown
    pub(super) free_clusters: Option<u32>,
    /// Whether `free_clusters` may be trusted for early rejection
    pub(super) free_valid: bool,
}

impl AllocState {
    pub(super) fn known_free(&self) -> Option<u32> {
        self.free_clusters.filter(|_| self.free_valid)
    }
}

/// One filesystem's File Allocation Table and its mirrors
pub struct FatTable {
    pub(super) store: Arc<dyn BlockStore>,
    pub(super) geometry: Geometry,
    pub(super) sync: bool,
    pub(super) discard: bool,
    pub(super) state: Mutex<AllocState>,
    /// Serializes access to the shared bytes of 12-bit entries
    fat12_lock: Mutex<()>,
    /// Throttles corruption reports for the whole volume
    ratelimit: RateLimit,
}

impl FatTable {
    pub fn new(store: Arc<dyn BlockStore>, geometry: Geometry, options: &MountOptions) -> Self {
        Self {
            store,
            geometry,
            sync: options.sync,
            discard: options.discard,
            state: Mutex::new(AllocState {
                prev_free: FATX_START_ENT - 1,
                free_clusters: None,
                free_valid: false,
            }),
            fat12_lock: Mutex::new(()),
            ratelimit: RateLimit::new(RATELIMIT_BURST, RATELIMIT_INTERVAL),
        }
    }

    pub fn width(&self) -> FatWidth {
        self.geometry.width
    }

    pub fn max_cluster(&self) -> u32 {
        self.geometry.max_cluster
    }

    /// Current free-cluster hint, if known and valid
    pub fn free_clusters(&self) -> Option<u32> {
        self.state.lock().known_free()
    }

    /// Next-fit cursor: the most recently allocated cluster
    pub fn prev_free(&self) -> u32 {
        self.state.lock().prev_free
    }

    /// Seeds the allocation state, e.g. from an on-disk info sector
    ///
    /// An out-of-range cursor is reset to the start of the table.
    pub fn set_alloc_hint(&self, prev_free: u32, free_clusters: Option<u32>) {
        let mut state = self.state.lock();
        state.prev_free = if prev_free < self.geometry.max_cluster {
            prev_free
        } else {
            FATX_START_ENT - 1
        };
        state.free_clusters = free_clusters;
        state.free_valid = free_clusters.is_some();
    }

    /// Marks the free-cluster hint as untrusted
    pub fn invalidate_free_hint(&self) {
        self.state.lock().free_valid = false;
    }

    pub(super) fn ratelimit(&self) -> &RateLimit {
        &self.ratelimit
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, AllocState> {
        self.state.lock()
    }

    /// Reads entry `entry`, reusing the cursor's blocks when possible
    pub fn read_entry(&self, cursor: &mut FatCursor, entry: u32) -> Result<FatEntry, FatxError> {
        if entry < FATX_START_ENT || self.geometry.max_cluster <= entry {
            cursor.release();
            if self.ratelimit.allow() {
                error!("FATX-fs error: invalid access to FATX (entry 0x{:08x})", entry);
            }
            return Err(FatxError::InvalidEntry(entry));
        }

        cursor.set_entry(entry);
        let (offset, blocknr) = self.geometry.ent_blocknr(entry);
        if !self.update_ptr(cursor, offset, blocknr) {
            cursor.release();
            self.ent_bread(cursor, offset, blocknr)?;
        }
        Ok(self.ent_get(cursor))
    }

    /// Stores `value` at the cursor's entry, then mirrors the touched blocks
    ///
    /// The primary blocks are flushed first when `durable` is set or the mount
    /// is synchronous. A failed mirror write is reported but leaves the
    /// primary as written. Caller holds the table lock.
    pub(super) fn write_entry(
        &self,
        cursor: &FatCursor,
        value: FatEntry,
        durable: bool,
    ) -> Result<(), FatxError> {
        self.ent_put(cursor, value);
        if durable || self.sync {
            sync_buffers(&*self.store, &cursor.bhs)?;
        }
        self.mirror_bhs(&cursor.bhs)
    }

    /// Moves to the next entry; false at `max_cluster` or when the next entry
    /// needs blocks the cursor does not hold
    pub fn advance(&self, cursor: &mut FatCursor) -> bool {
        self.ent_next(cursor) && cursor.entry < self.geometry.max_cluster
    }

    /// Reads one entry without keeping a cursor
    pub fn get(&self, entry: u32) -> Result<FatEntry, FatxError> {
        let mut cursor = FatCursor::new();
        self.read_entry(&mut cursor, entry)
    }

    /// Writes one entry under the table lock
    pub fn set(&self, entry: u32, value: FatEntry, durable: bool) -> Result<(), FatxError> {
        let _state = self.lock();
        let mut cursor = FatCursor::new();
        self.read_entry(&mut cursor, entry)?;
        self.write_entry(&cursor, value, durable)
    }

    /// Reloads the blocks for the cursor's current entry
    pub(super) fn read_block(&self, cursor: &mut FatCursor) -> Result<(), FatxError> {
        cursor.release();
        let (offset, blocknr) = self.geometry.ent_blocknr(cursor.entry);
        self.ent_bread(cursor, offset, blocknr)
    }

    /// Positions the cursor at `entry` without loading anything
    pub(super) fn seek(&self, cursor: &mut FatCursor, entry: u32) {
        cursor.release();
        cursor.set_entry(entry);
    }

    /// Issues read-ahead for `blocks` blocks starting at the cursor's entry
    pub(super) fn reada(&self, cursor: &FatCursor, blocks: u64) {
        let (_, blocknr) = self.geometry.ent_blocknr(cursor.entry);
        for i in 0..blocks {
            self.store.breadahead(blocknr + i);
        }
    }

    /// Copies `bhs` into every backup FAT at the same offset
    pub(super) fn mirror_bhs(&self, bhs: &[BufferRef]) -> Result<(), FatxError> {
        for copy in 1..self.geometry.fats as u64 {
            let backup = self.geometry.fat_length * copy;
            for bh in bhs {
                let c_bh = self.store.getblk(backup + bh.blocknr())?;
                c_bh.data_mut().copy_from_slice(&bh.data());
                c_bh.mark_dirty();
                if self.sync {
                    self.store.sync_buffer(&c_bh)?;
                }
            }
        }
        Ok(())
    }

    /// Does the cursor already hold the block(s) for this entry?
    fn update_ptr(&self, cursor: &mut FatCursor, offset: usize, blocknr: u64) -> bool {
        match cursor.bhs.first() {
            Some(bh) if bh.blocknr() == blocknr => {}
            _ => return false,
        }

        if self.geometry.width == FatWidth::Fat12 {
            if offset + 1 < self.geometry.block_size {
                cursor.bhs.truncate(1);
            } else {
                // This entry needs the next block too
                match cursor.bhs.get(1) {
                    Some(next) if next.blocknr() == blocknr + 1 => {}
                    _ => return false,
                }
            }
        }
        cursor.offset = offset;
        true
    }

    fn ent_bread(&self, cursor: &mut FatCursor, offset: usize, blocknr: u64) -> Result<(), FatxError> {
        let straddles =
            self.geometry.width == FatWidth::Fat12 && offset + 1 >= self.geometry.block_size;

        for nr in blocknr..=blocknr + straddles as u64 {
            match self.store.bread(nr) {
                Ok(bh) => cursor.bhs.push(bh),
                Err(err) => {
                    cursor.release();
                    error!("FATX read failed (blocknr {})", nr);
                    return Err(err);
                }
            }
        }
        cursor.offset = offset;
        Ok(())
    }

    pub(super) fn ent_get(&self, cursor: &FatCursor) -> FatEntry {
        let width = self.geometry.width;
        let offset = cursor.offset;
        let raw = match width {
            FatWidth::Fat12 => {
                let _guard = self.fat12_lock.lock();
                let (b0, b1) = match cursor.bhs.get(1) {
                    Some(next) => (cursor.bhs[0].data()[offset], next.data()[0]),
                    None => {
                        let data = cursor.bhs[0].data();
                        (data[offset], data[offset + 1])
                    }
                };
                get12(cursor.entry, b0, b1)
            }
            FatWidth::Fat16 => {
                let data = cursor.bhs[0].data();
                u16::from_le_bytes([data[offset], data[offset + 1]]) as u32
            }
            FatWidth::Fat32 => {
                let data = cursor.bhs[0].data();
                u32::from_le_bytes([
                    data[offset],
                    data[offset + 1],
                    data[offset + 2],
                    data[offset + 3],
                ])
            }
        };
        width.decode(raw)
    }

    pub(super) fn ent_put(&self, cursor: &FatCursor, value: FatEntry) {
        let width = self.geometry.width;
        let offset = cursor.offset;
        let new = width.encode(value);
        match width {
            FatWidth::Fat12 => {
                let _guard = self.fat12_lock.lock();
                match cursor.bhs.get(1) {
                    Some(next) => {
                        let mut d0 = cursor.bhs[0].data_mut();
                        let mut d1 = next.data_mut();
                        put12(cursor.entry, new, &mut d0[offset], &mut d1[0]);
                    }
                    None => {
                        let mut data = cursor.bhs[0].data_mut();
                        let (lo, hi) = data.split_at_mut(offset + 1);
                        put12(cursor.entry, new, &mut lo[offset], &mut hi[0]);
                    }
                }
            }
            FatWidth::Fat16 => {
                let mut data = cursor.bhs[0].data_mut();
                data[offset..offset + 2].copy_from_slice(&(new as u16).to_le_bytes());
            }
            FatWidth::Fat32 => {
                let mut data = cursor.bhs[0].data_mut();
                let slot = &mut data[offset..offset + 4];
                let old = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]);
                let new = new | (old & !width.mask());
                slot.copy_from_slice(&new.to_le_bytes());
            }
        }
        for bh in &cursor.bhs {
            bh.mark_dirty();
        }
    }

    fn ent_next(&self, cursor: &mut FatCursor) -> bool {
        let block_size = self.geometry.block_size;
        let entry = cursor.entry;
        cursor.entry += 1;
        if cursor.bhs.is_empty() {
            return false;
        }

        match self.geometry.width {
            FatWidth::Fat12 => {
                if cursor.bhs.len() == 2 {
                    // Second byte was at the start of bhs[1]; move the window onto it
                    cursor.offset = (entry & 1) as usize;
                    cursor.bhs.remove(0);
                    return true;
                }
                let next_p1 = cursor.offset + 2 + (entry & 1) as usize;
                if next_p1 < block_size {
                    cursor.offset = next_p1 - 1;
                    return true;
                }
                false
            }
            FatWidth::Fat16 => {
                if cursor.offset + 2 < block_size {
                    cursor.offset += 2;
                    return true;
                }
                false
            }
            FatWidth::Fat32 => {
                if cursor.offset + 4 < block_size {
                    cursor.offset += 4;
                    return true;
                }
                false
            }
        }
    }
}

/// Adds the cursor's blocks to `bhs`, skipping ones already collected
pub(super) fn collect_bhs(bhs: &mut Vec<BufferRef>, cursor: &FatCursor) {
    for bh in &cursor.bhs {
        if !bhs.iter().any(|held| Arc::ptr_eq(held, bh)) {
            bhs.push(bh.clone());
        }
    }
}
