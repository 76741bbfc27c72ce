//! Short directory entry (32 bytes)

use super::fat_entry::FatWidth;
use crate::constants::fatx::*;
use bytes::{Buf, BufMut};

const ATTR_ARCHIVE: u8 = 0x20;

/// The fields of an on-disk directory entry the engine reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    /// 8 character name followed by 3 character extension, space padded
    pub name: [u8; 11],

    /// File attributes (read-only, directory, etc)
    pub attr: u8,

    /// High 16 bits of the first cluster (32-bit tables only)
    pub starthi: u16,

    /// Low 16 bits of the first cluster
    pub start: u16,

    /// File size in bytes
    pub size: u32,
}

impl DirEntry {
    /// Parses the first 32 bytes of `raw`
    pub fn parse(raw: &[u8]) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&raw[..11]);
        let attr = raw[11];

        let mut rest = &raw[20..DIR_ENTRY_SIZE];
        let starthi = rest.get_u16_le();
        rest.advance(4); // time, date
        let start = rest.get_u16_le();
        let size = rest.get_u32_le();

        Self {
            name,
            attr,
            starthi,
            start,
            size,
        }
    }

    /// Stores the modelled fields into `raw`, leaving timestamps untouched
    pub fn write(&self, raw: &mut [u8]) {
        let mut head = &mut raw[..12];
        head.put_slice(&self.name);
        head.put_u8(self.attr);

        let mut hi = &mut raw[20..22];
        hi.put_u16_le(self.starthi);

        let mut tail = &mut raw[26..DIR_ENTRY_SIZE];
        tail.put_u16_le(self.start);
        tail.put_u32_le(self.size);
    }

    /// Creates a new file entry with given name and starting cluster
    pub fn new_file(name: &str, ext: &str, start: u32) -> Self {
        let mut entry = Self {
            name: [0x20; 11],
            attr: ATTR_ARCHIVE,
            starthi: 0,
            start: 0,
            size: 0,
        };

        let name_bytes = name.as_bytes();
        let n = name_bytes.len().min(8);
        entry.name[..n].copy_from_slice(&name_bytes[..n]);

        let ext_bytes = ext.as_bytes();
        let e = ext_bytes.len().min(3);
        entry.name[8..8 + e].copy_from_slice(&ext_bytes[..e]);

        entry.set_start(start);
        entry
    }

    /// Creates a new directory entry with given name and starting cluster
    pub fn new_directory(name: &str, start: u32) -> Self {
        let mut entry = Self::new_file(name, "", start);
        entry.attr = ATTR_DIR;
        entry
    }

    /// Returns true if this slot ends the directory
    pub fn is_end(&self) -> bool {
        self.name[0] == 0x00
    }

    /// Returns true if entry is marked as deleted
    pub fn is_deleted(&self) -> bool {
        self.name[0] == DELETED_FLAG
    }

    /// Returns true if the slot holds no live entry
    pub fn is_free(&self) -> bool {
        self.is_end() || self.is_deleted()
    }

    pub fn is_directory(&self) -> bool {
        self.attr & ATTR_DIR != 0
    }

    /// Returns true for the `.` and `..` entries
    pub fn is_dot_entry(&self) -> bool {
        &self.name == MSDOS_DOT || &self.name == MSDOS_DOTDOT
    }

    /// First cluster; the high half only counts on 32-bit tables
    pub fn start(&self, width: FatWidth) -> u32 {
        let mut cluster = self.start as u32;
        if width == FatWidth::Fat32 {
            cluster |= (self.starthi as u32) << 16;
        }
        cluster
    }

    pub fn set_start(&mut self, cluster: u32) {
        self.start = cluster as u16;
        self.starthi = (cluster >> 16) as u16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_layout() {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw[..11].copy_from_slice(b"HELLO   TXT");
        raw[11] = ATTR_ARCHIVE;
        raw[20..22].copy_from_slice(&0x0001u16.to_le_bytes());
        raw[26..28].copy_from_slice(&0x2345u16.to_le_bytes());
        raw[28..32].copy_from_slice(&4096u32.to_le_bytes());

        let de = DirEntry::parse(&raw);
        assert_eq!(&de.name, b"HELLO   TXT");
        assert_eq!(de.size, 4096);
        assert_eq!(de.start(FatWidth::Fat32), 0x0001_2345);
        assert_eq!(de.start(FatWidth::Fat16), 0x2345);
        assert!(!de.is_directory());
    }

    #[test]
    fn test_write_then_parse() {
        let de = DirEntry::new_directory("SUB", 0x0003_0007);
        let mut raw = [0xAAu8; DIR_ENTRY_SIZE];
        de.write(&mut raw);
        assert_eq!(raw[12..20], [0xAAu8; 8]);
        assert_eq!(raw[22..26], [0xAAu8; 4]);
        assert_eq!(DirEntry::parse(&raw), de);
        assert!(de.is_directory());
    }

    #[test]
    fn test_free_and_dot_entries() {
        let mut de = DirEntry::new_directory(".", 5);
        assert!(de.is_dot_entry());
        assert!(!de.is_free());

        de.name[0] = DELETED_FLAG;
        assert!(de.is_free() && de.is_deleted() && !de.is_end());

        assert!(DirEntry::parse(&[0u8; DIR_ENTRY_SIZE]).is_end());
        assert!(DirEntry::new_directory("..", 0).is_dot_entry());
    }
}
