//! Volume layout and mount options

use super::fat_entry::FatWidth;
use crate::constants::fatx::*;
use crate::filesys::FatxError;

/// On-disk layout of a FATX volume, in blocks of `block_size` bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Bit width of FAT entries
    pub width: FatWidth,

    /// Size of a block in bytes (a power of two, at least 512)
    pub block_size: usize,

    /// Blocks per cluster
    pub sec_per_clus: u32,

    /// First block of the primary FAT
    pub fat_start: u64,

    /// Blocks per FAT copy
    pub fat_length: u64,

    /// Number of FAT copies, primary included
    pub fats: u8,

    /// First block of the fixed root directory (12/16-bit volumes)
    pub dir_start: u64,

    /// Entries in the fixed root directory, 0 when the root is a chain
    pub dir_entries: u32,

    /// First block of cluster `FATX_START_ENT`
    pub data_start: u64,

    /// One past the highest valid cluster number
    pub max_cluster: u32,

    /// First cluster of the root directory on 32-bit volumes
    pub root_cluster: u32,
}

impl Geometry {
    /// Lays out a volume over `total_blocks` blocks
    ///
    /// One reserved block, then `fats` FAT copies, then the fixed root
    /// directory (not for 32-bit tables), then the data area.
    pub fn compute(
        total_blocks: u64,
        block_size: usize,
        width: FatWidth,
        fats: u8,
        sec_per_clus: u32,
        root_entries: u32,
    ) -> Result<Self, FatxError> {
        if sec_per_clus == 0 || fats == 0 || block_size < 512 || !block_size.is_power_of_two() {
            return Err(FatxError::InvalidGeometry);
        }

        let reserved_blocks = 1u64;
        let dir_entries = if width == FatWidth::Fat32 { 0 } else { root_entries };
        let root_dir_blocks = (dir_entries as u64 * DIR_ENTRY_SIZE as u64).div_ceil(block_size as u64);

        let overhead = reserved_blocks + root_dir_blocks;
        if total_blocks <= overhead {
            return Err(FatxError::InvalidGeometry);
        }

        // Size the FAT for the upper bound of clusters, then count what is left
        let estimate = (total_blocks - overhead) / sec_per_clus as u64;
        let fat_length = width
            .table_bytes(estimate + FATX_START_ENT as u64)
            .div_ceil(block_size as u64);

        let fat_start = reserved_blocks;
        let dir_start = fat_start + fat_length * fats as u64;
        let data_start = dir_start + root_dir_blocks;
        if total_blocks <= data_start {
            return Err(FatxError::InvalidGeometry);
        }

        let clusters = (total_blocks - data_start) / sec_per_clus as u64;
        let limit = (width.bad_threshold() - FATX_START_ENT) as u64;
        let max_cluster = clusters.min(limit) as u32 + FATX_START_ENT;

        let geometry = Geometry {
            width,
            block_size,
            sec_per_clus,
            fat_start,
            fat_length,
            fats,
            dir_start,
            dir_entries,
            data_start,
            max_cluster,
            root_cluster: if width == FatWidth::Fat32 { FATX_START_ENT } else { 0 },
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Checks the layout is self-consistent
    pub fn validate(&self) -> Result<(), FatxError> {
        let fits = self
            .width
            .table_bytes(self.max_cluster as u64)
            <= self.fat_length * self.block_size as u64;

        if !self.block_size.is_power_of_two()
            || self.block_size < 512
            || self.sec_per_clus == 0
            || self.fats == 0
            || self.max_cluster <= FATX_START_ENT
            || self.max_cluster > self.width.bad_threshold()
            || !fits
        {
            return Err(FatxError::InvalidGeometry);
        }

        if self.width == FatWidth::Fat32 {
            if self.root_cluster < FATX_START_ENT || self.root_cluster >= self.max_cluster {
                return Err(FatxError::InvalidGeometry);
            }
        } else if self.dir_entries == 0 {
            return Err(FatxError::InvalidGeometry);
        }
        Ok(())
    }

    /// Returns the (byte offset, block number) holding FAT entry `entry`
    pub fn ent_blocknr(&self, entry: u32) -> (usize, u64) {
        let bytes = self.width.byte_offset(entry);
        let offset = (bytes & (self.block_size as u64 - 1)) as usize;
        let blocknr = self.fat_start + bytes / self.block_size as u64;
        (offset, blocknr)
    }

    /// First block of data cluster `clus`
    pub fn clus_to_blknr(&self, clus: u32) -> u64 {
        (clus - FATX_START_ENT) as u64 * self.sec_per_clus as u64 + self.data_start
    }

    pub fn dir_per_block(&self) -> usize {
        self.block_size / DIR_ENTRY_SIZE
    }

    /// Blocks occupied by the fixed root directory
    pub fn root_dir_blocks(&self) -> u64 {
        (self.dir_entries as u64 * DIR_ENTRY_SIZE as u64).div_ceil(self.block_size as u64)
    }

    pub fn cluster_size(&self) -> usize {
        self.block_size * self.sec_per_clus as usize
    }

    /// Splits a directory entry position into (block, slot in block)
    pub fn pos_to_blknr_slot(&self, pos: u64) -> Result<(u64, usize), FatxError> {
        if pos % DIR_ENTRY_SIZE as u64 != 0 {
            return Err(FatxError::InvalidPosition(pos));
        }
        let blocknr = pos / self.block_size as u64;
        let slot = (pos % self.block_size as u64) as usize / DIR_ENTRY_SIZE;
        Ok((blocknr, slot))
    }

    /// Position of slot `slot` in block `blocknr`
    pub fn entry_pos(&self, blocknr: u64, slot: usize) -> u64 {
        blocknr * self.block_size as u64 + (slot * DIR_ENTRY_SIZE) as u64
    }
}

/// Export behaviour for NFS-style file handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NfsMode {
    /// Handles only resolve to resident inodes
    #[default]
    StaleRw,
    /// Non-resident handles are rebuilt from their on-disk position
    NostaleRo,
}

/// Mount-time options consumed by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MountOptions {
    /// Write metadata through to the device before returning
    pub sync: bool,

    /// Issue discard requests for freed clusters
    pub discard: bool,

    pub nfs: NfsMode,
}
