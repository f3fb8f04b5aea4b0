// Shared test bands for the integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use rastercache::{
    BandBlockCache, BlockGeometry, CacheConfig, CacheState, DataType, Error, FlushErrorSlot,
    PinnedBlock, RasterBand, Result,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A band that keeps written blocks in memory.
pub struct MemoryBand {
    geometry: BlockGeometry,
    grid: (u32, u32),
    stored: Mutex<HashMap<(u32, u32), Vec<u8>>>,
    log: Mutex<Vec<(u32, u32)>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
    errors: FlushErrorSlot,
}

impl MemoryBand {
    pub fn new(block_width: u32, block_height: u32, grid: (u32, u32)) -> Arc<Self> {
        Arc::new(Self {
            geometry: BlockGeometry::new(block_width, block_height, DataType::Byte),
            grid,
            stored: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            errors: FlushErrorSlot::new(),
        })
    }

    /// A band of 1x1 byte blocks, so every block costs exactly one byte.
    pub fn unit(grid: (u32, u32)) -> Arc<Self> {
        Self::new(1, 1, grid)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<(u32, u32)> {
        self.log.lock().clone()
    }

    pub fn stored(&self, x: u32, y: u32) -> Option<Vec<u8>> {
        self.stored.lock().get(&(x, y)).cloned()
    }
}

impl RasterBand for MemoryBand {
    fn block_geometry(&self) -> BlockGeometry {
        self.geometry
    }

    fn block_grid(&self) -> (u32, u32) {
        self.grid
    }

    fn write_block(&self, x: u32, y: u32, data: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::write_back(x, y, "simulated write failure"));
        }
        self.stored.lock().insert((x, y), data.to_vec());
        self.log.lock().push((x, y));
        Ok(())
    }

    fn record_flush_error(&self, err: Error) {
        self.errors.record(err);
    }

    fn last_flush_error(&self) -> Option<Error> {
        self.errors.get()
    }

    fn clear_flush_error(&self) {
        self.errors.clear();
    }
}

pub fn new_state(budget_bytes: usize) -> Arc<CacheState> {
    Arc::new(CacheState::new(CacheConfig::new().budget_bytes(budget_bytes)).unwrap())
}

/// Returns the block pinned, reloading its contents from the band on a miss.
pub fn read_block(cache: &BandBlockCache, band: &MemoryBand, x: u32, y: u32) -> PinnedBlock {
    let access = cache.get_locked_block(x, y).unwrap();
    let created = access.is_created();
    let block = access.into_block();
    if created {
        if let Some(data) = band.stored(x, y) {
            block.data().copy_from_slice(&data);
        }
    }
    block
}

/// Fills a block with a pattern derived from its coordinates and marks it dirty.
pub fn write_pattern(cache: &BandBlockCache, x: u32, y: u32) {
    let block = cache.get_locked_block(x, y).unwrap().into_block();
    block.data().fill(pattern(x, y));
    block.mark_dirty();
}

pub fn pattern(x: u32, y: u32) -> u8 {
    (x.wrapping_mul(31).wrapping_add(y.wrapping_mul(17)) % 251) as u8
}
