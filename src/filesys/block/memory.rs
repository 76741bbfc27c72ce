//! In-memory block device implementation

use crate::filesys::{BlockDevice, FatxError};
use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;
use core::result::Result;

/// Block device that stores data in memory
pub struct MemoryBlockDevice {
    /// Blocks of data, each block_size bytes
    blocks: Vec<Vec<u8>>,

    /// Size of each block in bytes
    block_size: usize,

    /// Blocks whose reads fail
    bad_reads: BTreeSet<u64>,

    /// Blocks whose writes fail
    bad_writes: BTreeSet<u64>,

    /// Discarded ranges as (start, count), in request order
    discarded: Vec<(u64, u64)>,

    /// Number of successful block writes
    writes: u64,
}

impl MemoryBlockDevice {
    /// Creates a new memory block device with given size
    pub fn new(total_blocks: u64, block_size: usize) -> Self {
        let blocks = (0..total_blocks).map(|_| vec![0; block_size]).collect();
        Self {
            blocks,
            block_size,
            bad_reads: BTreeSet::new(),
            bad_writes: BTreeSet::new(),
            discarded: Vec::new(),
            writes: 0,
        }
    }

    /// Makes every subsequent read of `block_num` fail
    pub fn fail_reads(&mut self, block_num: u64) {
        self.bad_reads.insert(block_num);
    }

    /// Makes every subsequent write of `block_num` fail
    pub fn fail_writes(&mut self, block_num: u64) {
        self.bad_writes.insert(block_num);
    }

    /// Clears all injected failures
    pub fn heal(&mut self) {
        self.bad_reads.clear();
        self.bad_writes.clear();
    }

    pub fn discarded(&self) -> &[(u64, u64)] {
        &self.discarded
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Raw view of a block, bypassing any cache above the device
    pub fn block(&self, block_num: u64) -> &[u8] {
        &self.blocks[block_num as usize]
    }

    /// Validates block number is within bounds
    fn validate_block(&self, block_num: u64) -> Result<(), FatxError> {
        if block_num as usize >= self.blocks.len() {
            return Err(FatxError::IOError(block_num));
        }
        Ok(())
    }

    /// Validates buffer is correct block size
    fn validate_buffer(&self, block_num: u64, buf: &[u8]) -> Result<(), FatxError> {
        if buf.len() != self.block_size {
            return Err(FatxError::IOError(block_num));
        }
        Ok(())
    }
}

impl BlockDevice for MemoryBlockDevice {
    /// Reads block into buffer
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<(), FatxError> {
        self.validate_block(block_num)?;
        self.validate_buffer(block_num, buf)?;
        if self.bad_reads.contains(&block_num) {
            return Err(FatxError::IOError(block_num));
        }
        buf.copy_from_slice(&self.blocks[block_num as usize]);
        Ok(())
    }

    /// Writes buffer to block
    fn write_block(&mut self, block_num: u64, buf: &[u8]) -> Result<(), FatxError> {
        self.validate_block(block_num)?;
        self.validate_buffer(block_num, buf)?;
        if self.bad_writes.contains(&block_num) {
            return Err(FatxError::IOError(block_num));
        }
        self.blocks[block_num as usize].copy_from_slice(buf);
        self.writes += 1;
        Ok(())
    }

    /// Returns size of each block
    fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns total number of blocks
    fn total_blocks(&self) -> u64 {
        self.blocks.len() as u64
    }

    /// Records the range; contents are left as they were
    fn discard(&mut self, start: u64, count: u64) -> Result<(), FatxError> {
        self.validate_block(start + count.saturating_sub(1))?;
        self.discarded.push((start, count));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_block() {
        let mut dev = MemoryBlockDevice::new(4, 512);
        let data = vec![0xAB; 512];
        dev.write_block(2, &data).unwrap();

        let mut buf = vec![0; 512];
        dev.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!(dev.writes(), 1);
    }

    #[test]
    fn test_bounds_and_buffer_size() {
        let mut dev = MemoryBlockDevice::new(4, 512);
        let mut buf = vec![0; 512];
        assert_eq!(dev.read_block(4, &mut buf), Err(FatxError::IOError(4)));

        let short = vec![0; 100];
        assert_eq!(dev.write_block(0, &short), Err(FatxError::IOError(0)));
    }

    #[test]
    fn test_injected_failures() {
        let mut dev = MemoryBlockDevice::new(4, 512);
        dev.fail_writes(1);
        dev.fail_reads(3);

        let data = vec![1; 512];
        assert_eq!(dev.write_block(1, &data), Err(FatxError::IOError(1)));
        let mut buf = vec![0; 512];
        assert_eq!(dev.read_block(3, &mut buf), Err(FatxError::IOError(3)));

        dev.heal();
        assert!(dev.write_block(1, &data).is_ok());
        assert!(dev.read_block(3, &mut buf).is_ok());
    }

    #[test]
    fn test_discard_log() {
        let mut dev = MemoryBlockDevice::new(16, 512);
        dev.discard(4, 3).unwrap();
        dev.discard(10, 1).unwrap();
        assert_eq!(dev.discarded(), &[(4, 3), (10, 1)]);
        assert!(dev.discard(15, 2).is_err());
    }
}
