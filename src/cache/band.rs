//! The band contract and the per-band view of the cache.

use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

use super::block::{BlockGeometry, CachedBlock, PinnedBlock};
use super::directory::{BlockDirectory, DirectoryLayout};
use super::registry::CacheState;
use crate::{Error, Result};

/// What the cache needs from a raster band.
///
/// Implementations must be thread-safe: write-back runs on whichever thread
/// happens to evict the block.
pub trait RasterBand: Send + Sync {
    /// Geometry and pixel type of this band's blocks.
    fn block_geometry(&self) -> BlockGeometry;

    /// `(blocks_per_row, blocks_per_column)` of the band's block grid.
    fn block_grid(&self) -> (u32, u32);

    /// Persists one block. May be arbitrarily slow; never called with a cache lock held.
    fn write_block(&self, x: u32, y: u32, data: &[u8]) -> Result<()>;

    /// Called before a write-back. Return true if [`RasterBand::end_read_write`]
    /// must be called afterwards.
    fn begin_read_write(&self) -> bool {
        false
    }

    /// Called after a write-back when [`RasterBand::begin_read_write`] returned true.
    fn end_read_write(&self) {}

    /// Records a failed write-back. Only the first error should be kept.
    fn record_flush_error(&self, err: Error);

    /// The recorded write-back error, if any.
    fn last_flush_error(&self) -> Option<Error>;

    /// Forgets the recorded write-back error.
    fn clear_flush_error(&self);
}

/// A sticky first-error slot bands can embed to implement the flush error
/// part of [`RasterBand`].
#[derive(Debug, Default)]
pub struct FlushErrorSlot {
    error: Mutex<Option<Error>>,
}

impl FlushErrorSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `err` unless an error is already recorded.
    pub fn record(&self, err: Error) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// The recorded error.
    pub fn get(&self) -> Option<Error> {
        self.error.lock().clone()
    }

    /// Clears the slot.
    pub fn clear(&self) {
        *self.error.lock() = None;
    }
}

/// Outcome of [`BandBlockCache::get_locked_block`].
#[derive(Debug)]
pub enum BlockAccess {
    /// The block was already cached.
    Cached(PinnedBlock),
    /// A new, zero-filled block was created; the caller fills it.
    Created(PinnedBlock),
}

impl BlockAccess {
    /// Whether the block was created by this call.
    pub fn is_created(&self) -> bool {
        matches!(self, BlockAccess::Created(_))
    }

    /// The pinned block.
    pub fn into_block(self) -> PinnedBlock {
        match self {
            BlockAccess::Cached(block) | BlockAccess::Created(block) => block,
        }
    }
}

/// One band's view of the shared block cache.
///
/// Owns the band's [`BlockDirectory`] and ties it to the shared
/// [`CacheState`]. Dropping it flushes every block of the band.
pub struct BandBlockCache {
    state: Arc<CacheState>,
    band: Arc<dyn RasterBand>,
    blocks_per_row: u32,
    blocks_per_column: u32,
    directory: OnceLock<Arc<BlockDirectory>>,
}

impl BandBlockCache {
    /// Binds `band` to `state`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the band reports an empty grid or
    /// a block geometry whose byte size is zero or overflows.
    pub fn new(state: Arc<CacheState>, band: Arc<dyn RasterBand>) -> Result<Self> {
        let (blocks_per_row, blocks_per_column) = band.block_grid();
        if blocks_per_row == 0 || blocks_per_column == 0 {
            return Err(Error::invalid_argument(format!(
                "invalid block grid: {} x {}",
                blocks_per_row, blocks_per_column
            )));
        }
        band.block_geometry().size_bytes()?;

        Ok(Self { state, band, blocks_per_row, blocks_per_column, directory: OnceLock::new() })
    }

    /// The shared registry.
    pub fn state(&self) -> &Arc<CacheState> {
        &self.state
    }

    /// The band this cache writes back to.
    pub fn band(&self) -> &Arc<dyn RasterBand> {
        &self.band
    }

    fn directory(&self) -> Result<&Arc<BlockDirectory>> {
        if let Some(directory) = self.directory.get() {
            return Ok(directory);
        }
        let directory = BlockDirectory::new(
            self.blocks_per_row,
            self.blocks_per_column,
            self.state.directory_mode(),
        )?;
        Ok(self.directory.get_or_init(|| Arc::new(directory)))
    }

    fn check_coordinates(&self, x: u32, y: u32) -> Result<()> {
        if x >= self.blocks_per_row {
            return Err(Error::invalid_argument(format!("illegal block x offset {}", x)));
        }
        if y >= self.blocks_per_column {
            return Err(Error::invalid_argument(format!("illegal block y offset {}", y)));
        }
        Ok(())
    }

    /// Directory layout, once the directory exists.
    pub fn layout(&self) -> Option<DirectoryLayout> {
        self.directory.get().map(|d| d.layout())
    }

    /// Returns the cached block at (x, y), pinned, or `None` on a miss.
    pub fn lookup(&self, x: u32, y: u32) -> Option<PinnedBlock> {
        let pinned = self
            .directory
            .get()
            .and_then(|directory| directory.try_get_locked_block_ref(&self.state, x, y));
        self.state.record_lookup(pinned.is_some());
        pinned
    }

    /// Creates an unregistered block for (x, y) with the band's current geometry.
    pub fn create_block(&self, x: u32, y: u32) -> Result<Arc<CachedBlock>> {
        self.check_coordinates(x, y)?;
        let directory = self.directory()?;
        let block = CachedBlock::new(
            Arc::downgrade(&self.band),
            Arc::downgrade(directory),
            x,
            y,
            self.band.block_geometry(),
        )?;
        Ok(Arc::new(block))
    }

    /// Registers an internalized block in this band's directory.
    ///
    /// # Errors
    ///
    /// Registering a second block at an occupied coordinate is an invariant
    /// violation.
    pub fn adopt_block(&self, block: &PinnedBlock) -> Result<()> {
        let directory = self.directory()?;
        if !std::ptr::eq(block.block().directory().as_ptr(), Arc::as_ptr(directory)) {
            return Err(Error::invalid_argument("block belongs to another band"));
        }
        directory.adopt_block(block.x(), block.y(), block.handle())
    }

    /// Returns the block at (x, y), creating and caching it on a miss.
    ///
    /// A created block is zero-filled and clean; the caller fills it. If two
    /// threads miss on the same coordinate at once, one of them wins and the
    /// other gets the winner's block.
    pub fn get_locked_block(&self, x: u32, y: u32) -> Result<BlockAccess> {
        self.check_coordinates(x, y)?;
        loop {
            if let Some(pinned) = self.lookup(x, y) {
                return Ok(BlockAccess::Cached(pinned));
            }

            let block = self.create_block(x, y)?;
            let pinned = self.state.internalize(block)?;
            match self.directory()?.try_adopt(x, y, pinned.handle())? {
                None => return Ok(BlockAccess::Created(pinned)),
                Some(winner) => {
                    log::trace!("Lost registration race for block ({}, {}) to {:?}", x, y, winner);
                    self.state.discard(pinned);
                }
            }
        }
    }

    /// Writes `block` back now if it is dirty, keeping it cached.
    ///
    /// A failure is not returned; it lands in the band's sticky error slot.
    /// Both outcomes are counted in [`CacheStats`](crate::CacheStats).
    pub fn write_back(&self, block: &PinnedBlock) {
        let _ = self.state.write_back(block.block());
    }

    /// Drops the block at (x, y). A dirty block is written back first when
    /// `write_dirty` is set and discarded otherwise.
    pub fn flush_block(&self, x: u32, y: u32, write_dirty: bool) -> Result<bool> {
        self.check_coordinates(x, y)?;
        match self.directory.get() {
            Some(directory) => directory.flush_block(&self.state, x, y, write_dirty),
            None => Ok(false),
        }
    }

    /// Writes back and drops every block of the band.
    ///
    /// Returns the band's sticky write-back error if one is recorded,
    /// otherwise the first error of this flush.
    pub fn flush_cache(&self) -> Result<()> {
        let result = match self.directory.get() {
            Some(directory) => directory.flush_cache(&self.state),
            None => Ok(()),
        };
        match self.band.last_flush_error() {
            Some(err) => Err(err),
            None => result,
        }
    }

    /// Number of cached blocks of this band.
    pub fn resident_blocks(&self) -> usize {
        self.directory.get().map_or(0, |d| d.resident_blocks())
    }

    /// Number of allocated sub-grids of the directory.
    pub fn allocated_sub_grids(&self) -> usize {
        self.directory.get().map_or(0, |d| d.allocated_sub_grids())
    }

    /// Number of dirty blocks of this band.
    pub fn dirty_block_count(&self) -> usize {
        self.directory.get().map_or(0, |d| d.dirty_blocks())
    }

    /// The band's sticky write-back error.
    pub fn last_flush_error(&self) -> Option<Error> {
        self.band.last_flush_error()
    }

    /// Clears the band's sticky write-back error.
    pub fn clear_flush_error(&self) {
        self.band.clear_flush_error();
    }
}

impl Drop for BandBlockCache {
    fn drop(&mut self) {
        if let Err(err) = self.flush_cache() {
            log::warn!("Error flushing band cache on drop: {}", err);
        }
    }
}

impl std::fmt::Debug for BandBlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandBlockCache")
            .field("blocks_per_row", &self.blocks_per_row)
            .field("blocks_per_column", &self.blocks_per_column)
            .field("layout", &self.layout())
            .finish()
    }
}
