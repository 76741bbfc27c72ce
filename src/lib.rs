#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]
extern crate alloc;

pub mod constants;
pub mod filesys;
pub mod logging;

pub mod prelude {
    pub use crate::filesys::fatx::{
        ChainPos, DirEntry, FatEntry, FatWidth, Fatx, FatxInode, FidType, Geometry, MountOptions,
        NfsMode,
    };
    pub use crate::filesys::{BlockDevice, BlockStore, FatxError};
}
