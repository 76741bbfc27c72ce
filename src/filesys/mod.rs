use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::fmt;
use core::result::Result;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod block;
pub mod fatx;

/// Errors reported by the cluster-chain engine and its block store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatxError {
    /// FAT entry index outside `[FATX_START_ENT, max_cluster)`
    InvalidEntry(u32),
    /// Chain walk ran longer than the volume has clusters
    ChainLoop,
    /// Free entry found in the middle of a chain
    BrokenChain,
    /// Block requested past the end of an inode's chain
    BeyondEof,
    /// Directory entry position does not address a valid slot
    InvalidPosition(u64),
    /// Not enough free clusters
    InsufficientSpace,
    /// Block store failed to read or write a block
    IOError(u64),
    NotFound,
    /// Destination too short for the requested handle variant
    BufferTooSmall { required: usize },
    InvalidHandleType(u8),
    InvalidGeometry,
}

impl FatxError {
    /// Returns true for errors that indicate on-disk corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            FatxError::InvalidEntry(_)
                | FatxError::ChainLoop
                | FatxError::BrokenChain
                | FatxError::BeyondEof
                | FatxError::InvalidPosition(_)
        )
    }
}

impl fmt::Display for FatxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatxError::InvalidEntry(entry) => {
                write!(f, "invalid access to FATX (entry 0x{:08x})", entry)
            }
            FatxError::ChainLoop => write!(f, "detected the cluster chain loop"),
            FatxError::BrokenChain => write!(f, "invalid cluster chain"),
            FatxError::BeyondEof => write!(f, "request beyond EOF"),
            FatxError::InvalidPosition(pos) => write!(f, "invalid entry position {:#x}", pos),
            FatxError::InsufficientSpace => write!(f, "no space left on device"),
            FatxError::IOError(blocknr) => write!(f, "I/O error (blocknr {})", blocknr),
            FatxError::NotFound => write!(f, "not found"),
            FatxError::BufferTooSmall { required } => {
                write!(f, "buffer too small ({} bytes required)", required)
            }
            FatxError::InvalidHandleType(ty) => write!(f, "invalid file handle type {:#x}", ty),
            FatxError::InvalidGeometry => write!(f, "invalid volume geometry"),
        }
    }
}

/// Represents a block device that can be read from and written to
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<(), FatxError>;
    fn write_block(&mut self, block_num: u64, buf: &[u8]) -> Result<(), FatxError>;
    fn block_size(&self) -> usize;
    fn total_blocks(&self) -> u64;

    /// Tells the device the contents of a block range are no longer needed
    fn discard(&mut self, _start: u64, _count: u64) -> Result<(), FatxError> {
        Ok(())
    }
}

/// In-core copy of one block, shared between its users
pub struct Buffer {
    blocknr: u64,
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
}

pub type BufferRef = Arc<Buffer>;

impl Buffer {
    pub fn new(blocknr: u64, block_size: usize) -> Self {
        Self {
            blocknr,
            data: RwLock::new(vec![0u8; block_size].into_boxed_slice()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn blocknr(&self) -> u64 {
        self.blocknr
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clears the dirty flag, returning whether it was set
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

/// Cached block access used by the FAT engine
///
/// Implementations own caching and persistence policy. `bread` returns an
/// up-to-date buffer, `getblk` may return one whose contents are about to be
/// overwritten, and `sync_buffer` writes a dirty buffer through to the device.
pub trait BlockStore: Send + Sync {
    fn block_size(&self) -> usize;
    fn bread(&self, blocknr: u64) -> Result<BufferRef, FatxError>;
    fn getblk(&self, blocknr: u64) -> Result<BufferRef, FatxError>;
    fn sync_buffer(&self, buf: &Buffer) -> Result<(), FatxError>;

    /// Hint that `blocknr` will be read soon
    fn breadahead(&self, _blocknr: u64) {}

    fn issue_discard(&self, _start: u64, _count: u64) -> Result<(), FatxError> {
        Ok(())
    }
}

/// Writes back every dirty buffer in `bhs`, stopping at the first failure
pub fn sync_buffers(store: &dyn BlockStore, bhs: &[BufferRef]) -> Result<(), FatxError> {
    for bh in bhs {
        store.sync_buffer(bh)?;
    }
    Ok(())
}
