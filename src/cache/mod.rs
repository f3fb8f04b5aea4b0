//! Size-bounded LRU cache of raster blocks.
//!
//! A single [`CacheState`] tracks every cached block of every band and evicts
//! the least recently used ones once the byte budget is exceeded. Each band
//! reaches its blocks through a [`BandBlockCache`], which keeps a
//! [`BlockDirectory`] from block coordinates to registry handles.
//!
//! Lock order is registry lock, then directory lock, then block buffer.

mod band;
mod block;
mod directory;
mod lock;
mod registry;

pub use band::{BandBlockCache, BlockAccess, FlushErrorSlot, RasterBand};
pub use block::{BlockGeometry, BlockHandle, CachedBlock, DataType, PinnedBlock, MAX_BLOCK_BYTES};
pub use directory::{
    BlockDirectory, DirectoryLayout, FLAT_MODE_MAX_BLOCKS_PER_ROW, SUB_GRID_SHIFT, SUB_GRID_SIZE,
};
pub use lock::LockStats;
pub use registry::{CacheState, CacheStats, DirtyFlushGuard};
