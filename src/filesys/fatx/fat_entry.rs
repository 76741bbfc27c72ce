//! FAT entry values and their per-width encodings

use crate::constants::fatx::*;

/// Logical value of a FAT entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatEntry {
    Free,
    /// Next cluster in the chain
    Used(u32),
    /// End of chain
    Eof,
    /// Bad cluster; reads back as `Eof`
    Bad,
}

impl FatEntry {
    /// Returns true if this entry marks the end of a cluster chain
    pub fn is_end_of_chain(&self) -> bool {
        matches!(self, FatEntry::Eof | FatEntry::Bad)
    }

    /// Returns true if this cluster is unused/free
    pub fn is_free(&self) -> bool {
        matches!(self, FatEntry::Free)
    }
}

/// Bit width of the table's entries, fixed at mount time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatWidth {
    Fat12,
    Fat16,
    Fat32,
}

impl FatWidth {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            12 => Some(FatWidth::Fat12),
            16 => Some(FatWidth::Fat16),
            32 => Some(FatWidth::Fat32),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            FatWidth::Fat12 => 12,
            FatWidth::Fat16 => 16,
            FatWidth::Fat32 => 32,
        }
    }

    pub fn mask(self) -> u32 {
        match self {
            FatWidth::Fat12 => FATX12_MASK,
            FatWidth::Fat16 => FATX16_MASK,
            FatWidth::Fat32 => FATX32_MASK,
        }
    }

    /// Raw values at or above this threshold collapse to `Eof` on read
    pub fn bad_threshold(self) -> u32 {
        match self {
            FatWidth::Fat12 => BAD_FATX12,
            FatWidth::Fat16 => BAD_FATX16,
            FatWidth::Fat32 => BAD_FATX32,
        }
    }

    pub fn eof_value(self) -> u32 {
        match self {
            FatWidth::Fat12 => EOF_FATX12,
            FatWidth::Fat16 => EOF_FATX16,
            FatWidth::Fat32 => EOF_FATX32,
        }
    }

    /// Byte offset of `entry` from the start of the table
    pub fn byte_offset(self, entry: u32) -> u64 {
        let entry = entry as u64;
        match self {
            FatWidth::Fat12 => entry + (entry >> 1),
            FatWidth::Fat16 => entry << 1,
            FatWidth::Fat32 => entry << 2,
        }
    }

    /// Bytes needed to hold `entries` entries
    pub fn table_bytes(self, entries: u64) -> u64 {
        match self {
            FatWidth::Fat12 => (entries * 3).div_ceil(2),
            FatWidth::Fat16 => entries * 2,
            FatWidth::Fat32 => entries * 4,
        }
    }

    /// Normalizes a raw on-disk value
    pub fn decode(self, raw: u32) -> FatEntry {
        let next = raw & self.mask();
        if next == FATX_ENT_FREE {
            FatEntry::Free
        } else if next >= self.bad_threshold() {
            FatEntry::Eof
        } else {
            FatEntry::Used(next)
        }
    }

    /// Raw value written for `value`, before any bit preservation
    pub fn encode(self, value: FatEntry) -> u32 {
        match value {
            FatEntry::Free => FATX_ENT_FREE,
            FatEntry::Used(next) => next & self.mask(),
            FatEntry::Eof => self.eof_value(),
            FatEntry::Bad => self.bad_threshold(),
        }
    }
}

/// Reads a 12-bit entry from its two bytes
///
/// Odd entries use the high nibble of the first byte, even entries the low
/// nibble of the second.
pub fn get12(entry: u32, b0: u8, b1: u8) -> u32 {
    let raw = if entry & 1 != 0 {
        ((b0 as u32) >> 4) | ((b1 as u32) << 4)
    } else {
        ((b1 as u32) << 8) | b0 as u32
    };
    raw & FATX12_MASK
}

/// Packs a 12-bit entry into its two bytes, keeping the neighbour's nibble
pub fn put12(entry: u32, raw: u32, b0: &mut u8, b1: &mut u8) {
    let raw = raw & FATX12_MASK;
    if entry & 1 != 0 {
        *b0 = ((raw << 4) as u8) | (*b0 & 0x0F);
        *b1 = (raw >> 4) as u8;
    } else {
        *b0 = raw as u8;
        *b1 = (*b1 & 0xF0) | (raw >> 8) as u8;
    }
}
