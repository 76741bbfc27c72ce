//! Write-back buffer cache over a raw block device
//!
//! Buffers stay resident once loaded. Writers mark them dirty and either call
//! `sync_buffer` for an immediate write-through or leave them for `sync_all`.

use crate::filesys::{BlockDevice, BlockStore, Buffer, BufferRef, FatxError};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::result::Result;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

pub struct BufferCache<D: BlockDevice> {
    device: Mutex<D>,
    buffers: Mutex<BTreeMap<u64, BufferRef>>,
    block_size: usize,
    readahead_hints: AtomicU64,
}

impl<D: BlockDevice> BufferCache<D> {
    pub fn new(device: D) -> Self {
        let block_size = device.block_size();
        Self {
            device: Mutex::new(device),
            buffers: Mutex::new(BTreeMap::new()),
            block_size,
            readahead_hints: AtomicU64::new(0),
        }
    }

    /// Runs `f` with exclusive access to the underlying device
    pub fn with_device<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        f(&mut self.device.lock())
    }

    /// Returns the buffer for `blocknr` if it is resident
    pub fn cached(&self, blocknr: u64) -> Option<BufferRef> {
        self.buffers.lock().get(&blocknr).cloned()
    }

    /// Writes back every dirty buffer
    pub fn sync_all(&self) -> Result<(), FatxError> {
        let resident: alloc::vec::Vec<BufferRef> = self.buffers.lock().values().cloned().collect();
        for bh in resident {
            self.sync_buffer(&bh)?;
        }
        Ok(())
    }

    /// Drops every clean buffer so the next read goes to the device
    pub fn evict_clean(&self) {
        self.buffers.lock().retain(|_, bh| bh.is_dirty());
    }

    pub fn readahead_hints(&self) -> u64 {
        self.readahead_hints.load(Ordering::Relaxed)
    }

    fn insert(&self, bh: Buffer) -> BufferRef {
        let mut buffers = self.buffers.lock();
        buffers.entry(bh.blocknr()).or_insert_with(|| Arc::new(bh)).clone()
    }
}

impl<D: BlockDevice> BlockStore for BufferCache<D> {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn bread(&self, blocknr: u64) -> Result<BufferRef, FatxError> {
        if let Some(bh) = self.cached(blocknr) {
            return Ok(bh);
        }

        let bh = Buffer::new(blocknr, self.block_size);
        self.device
            .lock()
            .read_block(blocknr, &mut bh.data_mut()[..])?;
        Ok(self.insert(bh))
    }

    fn getblk(&self, blocknr: u64) -> Result<BufferRef, FatxError> {
        if let Some(bh) = self.cached(blocknr) {
            return Ok(bh);
        }
        if blocknr >= self.device.lock().total_blocks() {
            return Err(FatxError::IOError(blocknr));
        }
        Ok(self.insert(Buffer::new(blocknr, self.block_size)))
    }

    fn sync_buffer(&self, buf: &Buffer) -> Result<(), FatxError> {
        if !buf.take_dirty() {
            return Ok(());
        }

        let data = buf.data();
        let result = self.device.lock().write_block(buf.blocknr(), &data[..]);
        if result.is_err() {
            buf.mark_dirty();
        }
        result
    }

    fn breadahead(&self, blocknr: u64) {
        self.readahead_hints.fetch_add(1, Ordering::Relaxed);
        if self.cached(blocknr).is_none() {
            // Read-ahead is advisory; the real read reports any failure.
            let _ = self.bread(blocknr);
        }
    }

    fn issue_discard(&self, start: u64, count: u64) -> Result<(), FatxError> {
        self.device.lock().discard(start, count)
    }
}
