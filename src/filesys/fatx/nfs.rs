//! Stable file handles
//!
//! A handle names a file by the position of its directory entry plus a
//! generation number, optionally followed by the same pair for its parent
//! directory. Records are little-endian:
//!
//! ```text
//! 0   generation       u32
//! 4   pos[0..32]       u32
//! 8   pos[32..48]      u16
//! 10  parent pos[32..48] u16   (0 without parent)
//! 12  parent pos[0..32]  u32   (with parent only)
//! 16  parent generation  u32   (with parent only)
//! ```

use super::dir_entry::DirEntry;
use super::geometry::NfsMode;
use super::inode::FatxInode;
use super::Fatx;
use crate::constants::fatx::*;
use crate::filesys::FatxError;
use alloc::sync::Arc;
use bytes::{Buf, BufMut};
use log::error;

/// Entry position and generation of one inode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryId {
    pub pos: u64,
    pub generation: u32,
}

impl EntryId {
    /// Identity of `inode` as carried in a handle; the root has position 0
    pub fn of(inode: &FatxInode) -> Self {
        Self {
            pos: inode.pos().unwrap_or(0) & FATX_POS_MASK,
            generation: inode.generation(),
        }
    }
}

/// A decoded handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId {
    pub entry: EntryId,
    pub parent: Option<EntryId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FidType {
    WithoutParent,
    WithParent,
}

impl FidType {
    pub fn tag(self) -> u8 {
        match self {
            FidType::WithoutParent => FILEID_FATX_WITHOUT_PARENT,
            FidType::WithParent => FILEID_FATX_WITH_PARENT,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, FatxError> {
        match tag {
            FILEID_FATX_WITHOUT_PARENT => Ok(FidType::WithoutParent),
            FILEID_FATX_WITH_PARENT => Ok(FidType::WithParent),
            other => Err(FatxError::InvalidHandleType(other)),
        }
    }

    /// Record length in bytes
    pub fn size(self) -> usize {
        match self {
            FidType::WithoutParent => FATX_FID_SIZE_WITHOUT_PARENT,
            FidType::WithParent => FATX_FID_SIZE_WITH_PARENT,
        }
    }
}

/// Encodes a handle into `dest`, returning its length and type
pub fn encode(
    entry: EntryId,
    parent: Option<EntryId>,
    dest: &mut [u8],
) -> Result<(usize, FidType), FatxError> {
    let ty = if parent.is_some() {
        FidType::WithParent
    } else {
        FidType::WithoutParent
    };
    let required = ty.size();
    if dest.len() < required {
        return Err(FatxError::BufferTooSmall { required });
    }

    let mut buf = &mut dest[..required];
    buf.put_u32_le(entry.generation);
    buf.put_u32_le(entry.pos as u32);
    buf.put_u16_le((entry.pos >> 32) as u16);
    match parent {
        Some(parent) => {
            buf.put_u16_le((parent.pos >> 32) as u16);
            buf.put_u32_le(parent.pos as u32);
            buf.put_u32_le(parent.generation);
        }
        None => buf.put_u16_le(0),
    }
    Ok((required, ty))
}

/// Decodes a handle of type `tag`
pub fn decode(record: &[u8], tag: u8) -> Result<FileId, FatxError> {
    let ty = FidType::from_tag(tag)?;
    let required = ty.size();
    if record.len() < required {
        return Err(FatxError::BufferTooSmall { required });
    }

    let mut buf = &record[..required];
    let generation = buf.get_u32_le();
    let pos_low = buf.get_u32_le() as u64;
    let pos_hi = buf.get_u16_le() as u64;
    let parent_hi = buf.get_u16_le() as u64;

    let parent = match ty {
        FidType::WithParent => {
            let parent_low = buf.get_u32_le() as u64;
            Some(EntryId {
                pos: (parent_hi << 32) | parent_low,
                generation: buf.get_u32_le(),
            })
        }
        FidType::WithoutParent => None,
    };

    Ok(FileId {
        entry: EntryId {
            pos: (pos_hi << 32) | pos_low,
            generation,
        },
        parent,
    })
}

impl Fatx {
    /// Encodes a handle for `inode`, naming `parent` when given
    pub fn encode_fh(
        &self,
        inode: &FatxInode,
        parent: Option<&FatxInode>,
        dest: &mut [u8],
    ) -> Result<(usize, FidType), FatxError> {
        encode(EntryId::of(inode), parent.map(EntryId::of), dest)
    }

    /// Resolves a handle to its inode
    pub fn fh_to_inode(&self, record: &[u8], tag: u8) -> Result<Arc<FatxInode>, FatxError> {
        let fid = decode(record, tag)?;
        self.nfs_get_inode(fid.entry)
    }

    /// Resolves the parent named by a handle
    pub fn fh_to_parent(&self, record: &[u8], tag: u8) -> Result<Arc<FatxInode>, FatxError> {
        let fid = decode(record, tag)?;
        let parent = fid.parent.ok_or(FatxError::NotFound)?;
        self.nfs_get_inode(parent)
    }

    fn nfs_get_inode(&self, id: EntryId) -> Result<Arc<FatxInode>, FatxError> {
        if id.pos == 0 {
            return Ok(self.root().clone());
        }

        // generation 0 matches any inode at the position
        let resident = self
            .iget(id.pos)
            .filter(|inode| id.generation == 0 || inode.generation() == id.generation);
        if let Some(inode) = resident {
            return Ok(inode);
        }
        if self.options().nfs != NfsMode::NostaleRo {
            return Err(FatxError::NotFound);
        }

        let de = self.read_dir_entry(id.pos).map_err(|err| {
            error!(
                "FATX-fs: unable to read block for building NFS inode (pos {:#x}): {}",
                id.pos, err
            );
            err
        })?;
        if de.is_free() {
            return Err(FatxError::NotFound);
        }
        self.build_inode_with(&de, id.pos, Some(id.generation))
    }

    /// Finds the parent directory of `dir` through its `..` entry
    pub fn get_parent(&self, dir: &FatxInode) -> Result<Arc<FatxInode>, FatxError> {
        let (dotdot, _) = self.get_dotdot_entry(dir)?;
        let parent_logstart = dotdot.start(self.geometry().width);

        if let Some(parent) = self.dget(parent_logstart) {
            return Ok(parent);
        }
        if self.options().nfs == NfsMode::NostaleRo {
            return self.reconstruct_parent(parent_logstart);
        }
        Err(FatxError::NotFound)
    }

    /// Rebuilds the inode of a directory whose first cluster is `orphan_start`
    ///
    /// The directory's own `.` and `..` entries name it and its parent; the
    /// parent is then searched for the entry pointing at the directory.
    pub fn reconstruct_parent(&self, orphan_start: u32) -> Result<Arc<FatxInode>, FatxError> {
        let g = *self.geometry();
        if orphan_start < FATX_START_ENT || orphan_start >= g.max_cluster {
            return Err(FatxError::InvalidEntry(orphan_start));
        }

        let blknr = g.clus_to_blknr(orphan_start);
        let bh = self.store().bread(blknr).map_err(|err| {
            error!(
                "FATX-fs: unable to read cluster of parent directory (blocknr {})",
                blknr
            );
            err
        })?;
        let (dot, dotdot) = {
            let data = bh.data();
            (
                DirEntry::parse(&data[..DIR_ENTRY_SIZE]),
                DirEntry::parse(&data[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE]),
            )
        };

        let clus_to_match = dot.start(g.width);
        let search_clus = dotdot.start(g.width);
        if search_clus != 0 && (search_clus < FATX_START_ENT || search_clus >= g.max_cluster) {
            if self.fat().ratelimit().allow() {
                error!(
                    "FATX-fs error: corrupt .. entry in directory at cluster {} (start {})",
                    orphan_start, search_clus
                );
            }
            return Err(FatxError::InvalidEntry(search_clus));
        }

        let grandparent = match self.dget(search_clus) {
            Some(inode) => inode,
            None => {
                // Not resident; a throwaway inode is enough to walk it
                Arc::new(FatxInode::from_dir_entry(
                    self.inodes().alloc_ino(),
                    0,
                    &dotdot,
                    None,
                    &g,
                ))
            }
        };

        match self.scan_logstart(&grandparent, clus_to_match)? {
            Some((de, pos)) => self.build_inode(&de, pos),
            None => Err(FatxError::NotFound),
        }
    }
}
