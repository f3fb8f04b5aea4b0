//! # rastercache - A Shared LRU Cache for Raster Blocks
//!
//! rastercache keeps decoded raster tiles ("blocks") in memory under one
//! process-wide byte budget. Blocks of every band share a single LRU list;
//! when the budget is exceeded the least recently used unpinned blocks are
//! evicted, and dirty ones are written back to their band first.
//!
//! ## Architecture
//!
//! - **CacheState**: the shared registry holding the LRU list, the byte total and the budget
//! - **BandBlockCache**: one band's view, mapping block coordinates to cached blocks
//! - **PinnedBlock**: a guard that keeps a block resident while it is used
//! - **RasterBand**: the trait a band implements so blocks can be written back
//!
//! ## Example Usage
//!
//! ```rust
//! use rastercache::{
//!     BandBlockCache, BlockGeometry, CacheConfig, CacheState, DataType, FlushErrorSlot,
//!     RasterBand,
//! };
//! use std::sync::Arc;
//!
//! struct Band {
//!     errors: FlushErrorSlot,
//! }
//!
//! impl RasterBand for Band {
//!     fn block_geometry(&self) -> BlockGeometry {
//!         BlockGeometry::new(256, 256, DataType::Byte)
//!     }
//!     fn block_grid(&self) -> (u32, u32) {
//!         (8, 8)
//!     }
//!     fn write_block(&self, _x: u32, _y: u32, _data: &[u8]) -> rastercache::Result<()> {
//!         Ok(())
//!     }
//!     fn record_flush_error(&self, err: rastercache::Error) {
//!         self.errors.record(err);
//!     }
//!     fn last_flush_error(&self) -> Option<rastercache::Error> {
//!         self.errors.get()
//!     }
//!     fn clear_flush_error(&self) {
//!         self.errors.clear();
//!     }
//! }
//!
//! # fn main() -> Result<(), rastercache::Error> {
//! let state = Arc::new(CacheState::new(CacheConfig::new().budget_bytes(16 << 20))?);
//! let cache = BandBlockCache::new(Arc::clone(&state), Arc::new(Band { errors: FlushErrorSlot::new() }))?;
//!
//! let block = cache.get_locked_block(3, 4)?.into_block();
//! block.data().fill(7);
//! block.mark_dirty();
//! drop(block);
//!
//! cache.flush_cache()?;
//! assert_eq!(state.used_bytes(), 0);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod cache;
pub mod config;
pub mod error;

// Re-exports
pub use cache::{
    BandBlockCache, BlockAccess, BlockDirectory, BlockGeometry, BlockHandle, CacheState,
    CacheStats, CachedBlock, DataType, DirectoryLayout, DirtyFlushGuard, FlushErrorSlot,
    LockStats, PinnedBlock, RasterBand, MAX_BLOCK_BYTES,
};
pub use config::{CacheConfig, DirectoryMode, LockStrategy};
pub use error::{Error, Result};
