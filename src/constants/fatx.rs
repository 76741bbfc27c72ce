//! FATX on-disk and in-core constants

/// First usable FAT entry; entries 0 and 1 are reserved
pub const FATX_START_ENT: u32 = 2;

/// Raw value of a free FAT entry
pub const FATX_ENT_FREE: u32 = 0;

/// Values at or above these read back as end of chain
pub const BAD_FATX12: u32 = 0x0FF7;
pub const BAD_FATX16: u32 = 0xFFF7;
pub const BAD_FATX32: u32 = 0x0FFF_FFF7;

/// End-of-chain markers written to disk
pub const EOF_FATX12: u32 = 0x0FFF;
pub const EOF_FATX16: u32 = 0xFFFF;
pub const EOF_FATX32: u32 = 0x0FFF_FFFF;

/// Entry masks per width
pub const FATX12_MASK: u32 = 0x0FFF;
pub const FATX16_MASK: u32 = 0xFFFF;
pub const FATX32_MASK: u32 = 0x0FFF_FFFF;

/// Media descriptor stored in FAT entry 0 by `format`
pub const MEDIA_FIXED_DISK: u8 = 0xF8;

/// Maximum cached chain runs per inode (must be > 0)
pub const FATX_MAX_CACHE: usize = 8;

/// Cache id that is accepted regardless of the inode's epoch
pub const FATX_CACHE_VALID: u32 = 0;

/// Read-ahead window used when counting free clusters
pub const FATX_READA_SIZE: usize = 128 * 1024;

/// Size of an on-disk directory entry
pub const DIR_ENTRY_SIZE: usize = 32;

/// First name byte of a deleted directory entry
pub const DELETED_FLAG: u8 = 0xE5;

/// Directory attribute bit
pub const ATTR_DIR: u8 = 0x10;

/// Name of the self entry of a directory
pub const MSDOS_DOT: &[u8; 11] = b".          ";

/// Name of the parent entry of a directory
pub const MSDOS_DOTDOT: &[u8; 11] = b"..         ";

/// File handle types, as understood by the export layer
pub const FILEID_FATX_WITHOUT_PARENT: u8 = 0x71;
pub const FILEID_FATX_WITH_PARENT: u8 = 0x72;

/// File handle record sizes in bytes
pub const FATX_FID_SIZE_WITHOUT_PARENT: usize = 12;
pub const FATX_FID_SIZE_WITH_PARENT: usize = 24;

/// Positions carried by file handles are 48 bits wide
pub const FATX_POS_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Corruption reports allowed per rate-limit window
pub const RATELIMIT_BURST: u32 = 10;

/// Length of a rate-limit window, counted in reports
pub const RATELIMIT_INTERVAL: u32 = 100;
