//! Per-band block directory.
//!
//! Maps a block coordinate to the registry handle of its cached block. Narrow
//! grids use one flat slot array. Wider grids use a two-level layout of 64x64
//! sub-grids that are only allocated once a block inside them is registered,
//! so a huge raster that is touched sparsely costs memory in proportion to
//! what was touched.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicIsize, Ordering};

use super::block::{BlockHandle, PinnedBlock};
use super::registry::{CacheState, Removal};
use crate::config::DirectoryMode;
use crate::{Error, Result};

/// Grids with fewer blocks per row than this use the flat layout.
pub const FLAT_MODE_MAX_BLOCKS_PER_ROW: u32 = 32;

/// log2 of the sub-grid side.
pub const SUB_GRID_SHIFT: u32 = 6;

/// Side of a sub-grid, in blocks.
pub const SUB_GRID_SIZE: u32 = 1 << SUB_GRID_SHIFT;

const SUB_GRID_MASK: u32 = SUB_GRID_SIZE - 1;
const SUB_GRID_SLOTS: usize = (SUB_GRID_SIZE * SUB_GRID_SIZE) as usize;

/// Representation picked for a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryLayout {
    /// One slot per block of the grid.
    Flat,
    /// Lazily allocated 64x64 sub-grids.
    TwoLevel,
}

type SubGrid = Box<[Option<BlockHandle>]>;

enum Slots {
    Flat(Vec<Option<BlockHandle>>),
    TwoLevel { sub_grids_per_row: u32, sub_grids: Vec<Option<SubGrid>> },
}

impl Slots {
    fn get(&self, blocks_per_row: u32, x: u32, y: u32) -> Option<BlockHandle> {
        match self {
            Slots::Flat(slots) => slots[flat_index(blocks_per_row, x, y)],
            Slots::TwoLevel { sub_grids_per_row, sub_grids } => {
                let (outer, inner) = split_index(*sub_grids_per_row, x, y);
                sub_grids[outer].as_ref().and_then(|grid| grid[inner])
            }
        }
    }

    /// Slot for (x, y). Allocates the covering sub-grid only when `allocate` is set.
    fn slot_mut(
        &mut self,
        blocks_per_row: u32,
        x: u32,
        y: u32,
        allocate: bool,
    ) -> Option<&mut Option<BlockHandle>> {
        match self {
            Slots::Flat(slots) => Some(&mut slots[flat_index(blocks_per_row, x, y)]),
            Slots::TwoLevel { sub_grids_per_row, sub_grids } => {
                let (outer, inner) = split_index(*sub_grids_per_row, x, y);
                let grid = &mut sub_grids[outer];
                if grid.is_none() {
                    if !allocate {
                        return None;
                    }
                    *grid = Some(vec![None; SUB_GRID_SLOTS].into_boxed_slice());
                }
                grid.as_mut().map(|grid| &mut grid[inner])
            }
        }
    }

    fn occupied(&self) -> Vec<BlockHandle> {
        match self {
            Slots::Flat(slots) => slots.iter().flatten().copied().collect(),
            Slots::TwoLevel { sub_grids, .. } => sub_grids
                .iter()
                .flatten()
                .flat_map(|grid| grid.iter().flatten().copied())
                .collect(),
        }
    }
}

fn flat_index(blocks_per_row: u32, x: u32, y: u32) -> usize {
    y as usize * blocks_per_row as usize + x as usize
}

fn split_index(sub_grids_per_row: u32, x: u32, y: u32) -> (usize, usize) {
    let outer = (y >> SUB_GRID_SHIFT) as usize * sub_grids_per_row as usize
        + (x >> SUB_GRID_SHIFT) as usize;
    let inner = (((y & SUB_GRID_MASK) << SUB_GRID_SHIFT) | (x & SUB_GRID_MASK)) as usize;
    (outer, inner)
}

/// Maps block coordinates of one band to cached blocks.
pub struct BlockDirectory {
    blocks_per_row: u32,
    blocks_per_column: u32,
    layout: DirectoryLayout,
    slots: Mutex<Slots>,
    dirty_blocks: AtomicIsize,
}

impl BlockDirectory {
    /// Creates a directory for a grid of `blocks_per_row x blocks_per_column` blocks.
    ///
    /// With [`DirectoryMode::Auto`], grids narrower than 32 blocks get the flat
    /// layout and everything else the two-level one.
    pub fn new(blocks_per_row: u32, blocks_per_column: u32, mode: DirectoryMode) -> Result<Self> {
        if blocks_per_row == 0 || blocks_per_column == 0 {
            return Err(Error::invalid_argument(format!(
                "invalid block grid: {} x {}",
                blocks_per_row, blocks_per_column
            )));
        }

        let layout = match mode {
            DirectoryMode::Flat => DirectoryLayout::Flat,
            DirectoryMode::TwoLevel => DirectoryLayout::TwoLevel,
            DirectoryMode::Auto if blocks_per_row < FLAT_MODE_MAX_BLOCKS_PER_ROW => {
                DirectoryLayout::Flat
            }
            DirectoryMode::Auto => DirectoryLayout::TwoLevel,
        };

        let slots = match layout {
            DirectoryLayout::Flat => {
                let count = (blocks_per_row as usize)
                    .checked_mul(blocks_per_column as usize)
                    .ok_or_else(|| Error::invalid_argument("block grid too large for flat directory"))?;
                Slots::Flat(vec![None; count])
            }
            DirectoryLayout::TwoLevel => {
                let sub_grids_per_row = blocks_per_row.div_ceil(SUB_GRID_SIZE);
                let sub_grids_per_column = blocks_per_column.div_ceil(SUB_GRID_SIZE);
                let count = sub_grids_per_row as usize * sub_grids_per_column as usize;
                Slots::TwoLevel {
                    sub_grids_per_row,
                    sub_grids: std::iter::repeat_with(|| None).take(count).collect(),
                }
            }
        };

        log::debug!(
            "Block directory for {} x {} blocks uses {:?} layout",
            blocks_per_row,
            blocks_per_column,
            layout
        );

        Ok(Self {
            blocks_per_row,
            blocks_per_column,
            layout,
            slots: Mutex::new(slots),
            dirty_blocks: AtomicIsize::new(0),
        })
    }

    /// Layout chosen at construction.
    pub fn layout(&self) -> DirectoryLayout {
        self.layout
    }

    /// Blocks per row of the grid.
    pub fn blocks_per_row(&self) -> u32 {
        self.blocks_per_row
    }

    /// Blocks per column of the grid.
    pub fn blocks_per_column(&self) -> u32 {
        self.blocks_per_column
    }

    /// Whether (x, y) lies inside the grid.
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x < self.blocks_per_row && y < self.blocks_per_column
    }

    /// Handle registered at (x, y), if any. Never allocates.
    pub fn get(&self, x: u32, y: u32) -> Option<BlockHandle> {
        if !self.contains(x, y) {
            return None;
        }
        self.slots.lock().get(self.blocks_per_row, x, y)
    }

    /// Registers `handle` at (x, y).
    ///
    /// # Errors
    ///
    /// Registering over a live block is an invariant violation and never
    /// replaces the existing block.
    pub fn adopt_block(&self, x: u32, y: u32, handle: BlockHandle) -> Result<()> {
        match self.try_adopt(x, y, handle)? {
            None => Ok(()),
            Some(existing) => Err(Error::invariant_violation(format!(
                "block ({}, {}) already registered as {:?}",
                x, y, existing
            ))),
        }
    }

    /// Registers `handle` at (x, y) unless the slot is taken, in which case the
    /// current occupant is returned and nothing changes.
    pub(crate) fn try_adopt(
        &self,
        x: u32,
        y: u32,
        handle: BlockHandle,
    ) -> Result<Option<BlockHandle>> {
        if !self.contains(x, y) {
            return Err(Error::invalid_argument(format!(
                "block ({}, {}) outside {} x {} grid",
                x, y, self.blocks_per_row, self.blocks_per_column
            )));
        }

        let mut slots = self.slots.lock();
        let slot = slots
            .slot_mut(self.blocks_per_row, x, y, true)
            .ok_or_else(|| Error::invariant_violation("sub-grid allocation failed"))?;
        match *slot {
            Some(existing) => Ok(Some(existing)),
            None => {
                *slot = Some(handle);
                Ok(None)
            }
        }
    }

    /// Clears (x, y) if it still holds `handle`. Leaves the registry alone.
    pub fn unreference_block(&self, x: u32, y: u32, handle: BlockHandle) -> bool {
        if !self.contains(x, y) {
            return false;
        }
        let mut slots = self.slots.lock();
        match slots.slot_mut(self.blocks_per_row, x, y, false) {
            Some(slot) if *slot == Some(handle) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Looks up (x, y) and pins the block found there.
    ///
    /// A failed pin means the block was evicted between reading the slot and
    /// pinning it; the slot is read again.
    pub fn try_get_locked_block_ref(
        &self,
        state: &CacheState,
        x: u32,
        y: u32,
    ) -> Option<PinnedBlock> {
        let mut previous = None;
        loop {
            let handle = self.get(x, y)?;
            if let Some(pinned) = state.take_lock(handle) {
                return Some(pinned);
            }
            if previous == Some(handle) {
                log::debug!("Stale handle {:?} left at block ({}, {})", handle, x, y);
                return None;
            }
            previous = Some(handle);
        }
    }

    /// Drops the block at (x, y), writing it back first if dirty and `write_dirty` is set.
    ///
    /// Returns whether a block was there.
    pub fn flush_block(
        &self,
        state: &CacheState,
        x: u32,
        y: u32,
        write_dirty: bool,
    ) -> Result<bool> {
        let Some(handle) = self.get(x, y) else {
            return Ok(false);
        };

        match state.remove_block(handle) {
            Removal::Removed(block) => {
                let result = if write_dirty {
                    state.write_back(&block)
                } else {
                    block.mark_clean();
                    Ok(())
                };
                block.take_buffer();
                result.map(|()| true)
            }
            Removal::Gone => Ok(false),
            Removal::Pinned => Err(Error::invariant_violation(format!(
                "flushing pinned block ({}, {})",
                x, y
            ))),
        }
    }

    /// Writes back and drops every block of the directory.
    ///
    /// Keeps going after a failure and returns the first error. In the two-level
    /// layout only allocated sub-grids are visited, and each one is freed once
    /// empty.
    pub fn flush_cache(&self, state: &CacheState) -> Result<()> {
        let handles = self.slots.lock().occupied();
        let mut first_error = None;

        for handle in handles {
            let outcome = match state.remove_block(handle) {
                Removal::Removed(block) => {
                    let result = state.write_back(&block);
                    block.take_buffer();
                    result
                }
                Removal::Gone => Ok(()),
                Removal::Pinned => Err(Error::invariant_violation(format!(
                    "flushing pinned block {:?}",
                    handle
                ))),
            };
            if let Err(err) = outcome {
                first_error.get_or_insert(err);
            }
        }

        let freed = self.release_drained_sub_grids();
        if freed > 0 {
            log::debug!("Released {} drained sub-grids", freed);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn release_drained_sub_grids(&self) -> usize {
        let mut slots = self.slots.lock();
        let Slots::TwoLevel { sub_grids, .. } = &mut *slots else {
            return 0;
        };

        let mut freed = 0;
        for grid in sub_grids.iter_mut() {
            if grid.as_ref().is_some_and(|g| g.iter().all(Option::is_none)) {
                *grid = None;
                freed += 1;
            }
        }
        freed
    }

    /// Number of registered blocks.
    pub fn resident_blocks(&self) -> usize {
        self.slots.lock().occupied().len()
    }

    /// Number of allocated sub-grids; always 0 in the flat layout.
    pub fn allocated_sub_grids(&self) -> usize {
        match &*self.slots.lock() {
            Slots::Flat(_) => 0,
            Slots::TwoLevel { sub_grids, .. } => sub_grids.iter().flatten().count(),
        }
    }

    /// Number of dirty blocks of this band.
    pub fn dirty_blocks(&self) -> usize {
        self.dirty_blocks.load(Ordering::Acquire).max(0) as usize
    }

    pub(crate) fn add_dirty_blocks(&self, delta: isize) {
        self.dirty_blocks.fetch_add(delta, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for BlockDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockDirectory")
            .field("blocks_per_row", &self.blocks_per_row)
            .field("blocks_per_column", &self.blocks_per_column)
            .field("layout", &self.layout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(index: u32) -> BlockHandle {
        BlockHandle { index, generation: 0 }
    }

    #[test]
    fn test_layout_selection() {
        let narrow = BlockDirectory::new(31, 10_000, DirectoryMode::Auto).unwrap();
        assert_eq!(narrow.layout(), DirectoryLayout::Flat);

        let wide = BlockDirectory::new(32, 1, DirectoryMode::Auto).unwrap();
        assert_eq!(wide.layout(), DirectoryLayout::TwoLevel);

        let forced = BlockDirectory::new(4, 4, DirectoryMode::TwoLevel).unwrap();
        assert_eq!(forced.layout(), DirectoryLayout::TwoLevel);

        assert!(BlockDirectory::new(0, 4, DirectoryMode::Auto).is_err());
    }

    #[test]
    fn test_split_index() {
        assert_eq!(split_index(4, 0, 0), (0, 0));
        assert_eq!(split_index(4, 63, 0), (0, 63));
        assert_eq!(split_index(4, 64, 0), (1, 0));
        assert_eq!(split_index(4, 65, 1), (1, 65));
        assert_eq!(split_index(4, 0, 64), (4, 0));
    }

    #[test]
    fn test_adopt_and_get_flat() {
        let dir = BlockDirectory::new(10, 10, DirectoryMode::Auto).unwrap();
        assert_eq!(dir.get(3, 7), None);

        dir.adopt_block(3, 7, handle(1)).unwrap();
        assert_eq!(dir.get(3, 7), Some(handle(1)));
        assert_eq!(dir.resident_blocks(), 1);
        assert_eq!(dir.allocated_sub_grids(), 0);
    }

    #[test]
    fn test_two_level_allocates_lazily() {
        let dir = BlockDirectory::new(200, 200, DirectoryMode::Auto).unwrap();
        assert_eq!(dir.allocated_sub_grids(), 0);

        // Lookups never allocate.
        assert_eq!(dir.get(150, 150), None);
        assert!(!dir.unreference_block(150, 150, handle(0)));
        assert_eq!(dir.allocated_sub_grids(), 0);

        dir.adopt_block(150, 150, handle(1)).unwrap();
        dir.adopt_block(151, 150, handle(2)).unwrap();
        dir.adopt_block(0, 0, handle(3)).unwrap();
        assert_eq!(dir.allocated_sub_grids(), 2);
        assert_eq!(dir.get(151, 150), Some(handle(2)));
    }

    #[test]
    fn test_try_adopt_reports_occupant() {
        let dir = BlockDirectory::new(100, 100, DirectoryMode::Auto).unwrap();
        assert_eq!(dir.try_adopt(5, 5, handle(1)).unwrap(), None);
        assert_eq!(dir.try_adopt(5, 5, handle(2)).unwrap(), Some(handle(1)));
        assert_eq!(dir.get(5, 5), Some(handle(1)));
        assert!(dir.try_adopt(100, 0, handle(3)).is_err());
    }

    #[test]
    fn test_unreference_only_matching_handle() {
        let dir = BlockDirectory::new(8, 8, DirectoryMode::Auto).unwrap();
        dir.adopt_block(1, 1, handle(4)).unwrap();

        assert!(!dir.unreference_block(1, 1, handle(5)));
        assert_eq!(dir.get(1, 1), Some(handle(4)));
        assert!(dir.unreference_block(1, 1, handle(4)));
        assert_eq!(dir.get(1, 1), None);
    }

    #[test]
    fn test_out_of_range_is_a_miss() {
        let dir = BlockDirectory::new(8, 8, DirectoryMode::Auto).unwrap();
        assert_eq!(dir.get(8, 0), None);
        assert_eq!(dir.get(0, 8), None);
    }

    #[test]
    fn test_dirty_counter() {
        let dir = BlockDirectory::new(8, 8, DirectoryMode::Auto).unwrap();
        dir.add_dirty_blocks(2);
        dir.add_dirty_blocks(-1);
        assert_eq!(dir.dirty_blocks(), 1);
    }
}
