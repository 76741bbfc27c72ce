//! Block store implementations

pub mod cache;
pub mod memory;

pub use cache::BufferCache;
pub use memory::MemoryBlockDevice;
