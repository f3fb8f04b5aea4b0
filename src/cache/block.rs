//! Cached blocks and the pin guard handed out to callers.

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use super::band::RasterBand;
use super::directory::BlockDirectory;
use super::registry::DirtyFlushGuard;
use crate::{Error, Result};

/// Pixel element type of a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Signed 8-bit integer.
    Int8,
    /// Unsigned 8-bit integer.
    Byte,
    /// Unsigned 16-bit integer.
    UInt16,
    /// Signed 16-bit integer.
    Int16,
    /// Unsigned 32-bit integer.
    UInt32,
    /// Signed 32-bit integer.
    Int32,
    /// Unsigned 64-bit integer.
    UInt64,
    /// Signed 64-bit integer.
    Int64,
    /// 32-bit IEEE float.
    Float32,
    /// 64-bit IEEE float.
    Float64,
    /// Complex of two signed 16-bit integers.
    CInt16,
    /// Complex of two signed 32-bit integers.
    CInt32,
    /// Complex of two 32-bit floats.
    CFloat32,
    /// Complex of two 64-bit floats.
    CFloat64,
}

impl DataType {
    /// Size of one pixel element in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            DataType::Int8 | DataType::Byte => 1,
            DataType::UInt16 | DataType::Int16 => 2,
            DataType::UInt32 | DataType::Int32 | DataType::Float32 | DataType::CInt16 => 4,
            DataType::UInt64
            | DataType::Int64
            | DataType::Float64
            | DataType::CInt32
            | DataType::CFloat32 => 8,
            DataType::CFloat64 => 16,
        }
    }
}

/// Largest block buffer accepted, in bytes.
pub const MAX_BLOCK_BYTES: usize = i32::MAX as usize;

/// Shape and pixel type of a band's blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    /// Block width in pixels.
    pub width: u32,
    /// Block height in pixels.
    pub height: u32,
    /// Pixel element type.
    pub data_type: DataType,
}

impl BlockGeometry {
    /// Create a new geometry
    pub fn new(width: u32, height: u32, data_type: DataType) -> Self {
        Self { width, height, data_type }
    }

    /// Bytes needed for one block buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an empty block or one larger
    /// than [`MAX_BLOCK_BYTES`].
    pub fn size_bytes(&self) -> Result<usize> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::invalid_argument(format!(
                "invalid block dimension: {} x {}",
                self.width, self.height
            )));
        }
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|pixels| pixels.checked_mul(self.data_type.size_bytes()))
            .filter(|&bytes| bytes <= MAX_BLOCK_BYTES)
            .ok_or_else(|| {
                Error::invalid_argument(format!("too big block: {} x {}", self.width, self.height))
            })
    }
}

/// Stable handle of a block inside the LRU registry.
///
/// The generation changes every time an arena slot is reused, so a handle to
/// an evicted block can never resolve to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// One band's one tile of pixels.
///
/// Geometry is copied from the band when the block is created and never
/// changes afterwards.
pub struct CachedBlock {
    band: Weak<dyn RasterBand>,
    directory: Weak<BlockDirectory>,
    x: u32,
    y: u32,
    geometry: BlockGeometry,
    size_bytes: usize,
    data: Mutex<Option<Vec<u8>>>,
    dirty: AtomicBool,
    pins: AtomicU32,
    internalized: AtomicBool,
}

impl CachedBlock {
    pub(crate) fn new(
        band: Weak<dyn RasterBand>,
        directory: Weak<BlockDirectory>,
        x: u32,
        y: u32,
        geometry: BlockGeometry,
    ) -> Result<Self> {
        let size_bytes = geometry.size_bytes()?;
        Ok(Self {
            band,
            directory,
            x,
            y,
            geometry,
            size_bytes,
            data: Mutex::new(None),
            dirty: AtomicBool::new(false),
            pins: AtomicU32::new(0),
            internalized: AtomicBool::new(false),
        })
    }

    /// Block column.
    pub fn x(&self) -> u32 {
        self.x
    }

    /// Block row.
    pub fn y(&self) -> u32 {
        self.y
    }

    /// Geometry snapshot taken at creation.
    pub fn geometry(&self) -> BlockGeometry {
        self.geometry
    }

    /// Buffer size in bytes (`width * height * element size`).
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Whether the buffer holds changes not yet written back.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Number of outstanding pins.
    pub fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    /// Whether a buffer has been attached.
    pub fn has_buffer(&self) -> bool {
        self.data.lock().is_some()
    }

    pub(crate) fn directory(&self) -> &Weak<BlockDirectory> {
        &self.directory
    }

    /// Marks the block dirty. Returns true if it was clean before.
    pub(crate) fn mark_dirty(&self) -> bool {
        let was_clean = !self.dirty.swap(true, Ordering::AcqRel);
        if was_clean {
            if let Some(directory) = self.directory.upgrade() {
                directory.add_dirty_blocks(1);
            }
        }
        was_clean
    }

    /// Marks the block clean. Returns true if it was dirty before.
    pub(crate) fn mark_clean(&self) -> bool {
        let was_dirty = self.dirty.swap(false, Ordering::AcqRel);
        if was_dirty {
            if let Some(directory) = self.directory.upgrade() {
                directory.add_dirty_blocks(-1);
            }
        }
        was_dirty
    }

    /// Claims the block for admission into a registry. Fails if it was admitted before.
    pub(crate) fn claim_internalization(&self) -> bool {
        !self.internalized.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn add_pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn drop_pin(&self) {
        let previous = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "pin count underflow on block ({}, {})", self.x, self.y);
    }

    pub(crate) fn install_buffer(&self, buffer: Vec<u8>) {
        *self.data.lock() = Some(buffer);
    }

    pub(crate) fn take_buffer(&self) -> Option<Vec<u8>> {
        self.data.lock().take()
    }

    /// Writes the block back to its band if it is dirty.
    ///
    /// The block is marked clean before the band is called, whatever the
    /// outcome. A failure is recorded in the band's sticky error slot and also
    /// returned. Once the band holds a sticky error, further dirty blocks of
    /// that band are dropped without calling it.
    pub(crate) fn write(&self) -> Result<()> {
        if !self.mark_clean() {
            return Ok(());
        }

        let Some(band) = self.band.upgrade() else {
            log::warn!("Dropping dirty block ({}, {}): its band no longer exists", self.x, self.y);
            return Err(Error::write_back(self.x, self.y, "band no longer exists"));
        };

        if let Some(err) = band.last_flush_error() {
            return Err(err);
        }

        let _no_dirty_flush = DirtyFlushGuard::enter();
        let leave = band.begin_read_write();
        let result = {
            let data = self.data.lock();
            band.write_block(self.x, self.y, data.as_deref().unwrap_or(&[]))
        };
        if leave {
            band.end_read_write();
        }

        if let Err(err) = &result {
            log::warn!("Failed to write back block ({}, {}): {}", self.x, self.y, err);
            band.record_flush_error(err.clone());
        }
        result
    }

    /// Removes the block from its directory if the slot still holds `handle`.
    pub(crate) fn unregister(&self, handle: BlockHandle) {
        if let Some(directory) = self.directory.upgrade() {
            directory.unreference_block(self.x, self.y, handle);
        }
    }
}

impl fmt::Debug for CachedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedBlock")
            .field("x", &self.x)
            .field("y", &self.y)
            .field("geometry", &self.geometry)
            .field("dirty", &self.is_dirty())
            .field("pins", &self.pin_count())
            .finish()
    }
}

/// A pinned block.
///
/// While a `PinnedBlock` exists its block cannot be evicted or destroyed.
/// Cloning adds a pin; dropping releases exactly one.
pub struct PinnedBlock {
    block: Arc<CachedBlock>,
    handle: BlockHandle,
}

impl PinnedBlock {
    /// Wraps a block whose pin has already been taken.
    pub(crate) fn from_pinned(block: Arc<CachedBlock>, handle: BlockHandle) -> Self {
        Self { block, handle }
    }

    /// Registry handle of the block.
    pub fn handle(&self) -> BlockHandle {
        self.handle
    }

    pub(crate) fn block(&self) -> &Arc<CachedBlock> {
        &self.block
    }

    /// Block column.
    pub fn x(&self) -> u32 {
        self.block.x
    }

    /// Block row.
    pub fn y(&self) -> u32 {
        self.block.y
    }

    /// Geometry snapshot taken at creation.
    pub fn geometry(&self) -> BlockGeometry {
        self.block.geometry
    }

    /// Buffer size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.block.size_bytes
    }

    /// Whether the block holds unwritten changes.
    pub fn is_dirty(&self) -> bool {
        self.block.is_dirty()
    }

    /// Current number of pins, this one included.
    pub fn pin_count(&self) -> u32 {
        self.block.pin_count()
    }

    /// Flags the block as modified so it is written back before eviction.
    pub fn mark_dirty(&self) {
        self.block.mark_dirty();
    }

    /// Clears the dirty flag without writing anything.
    pub fn mark_clean(&self) {
        self.block.mark_clean();
    }

    /// Locks and returns the pixel buffer.
    ///
    /// Do not hold the guard across [`BandBlockCache::write_back`].
    ///
    /// [`BandBlockCache::write_back`]: crate::BandBlockCache::write_back
    pub fn data(&self) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.block.data.lock(), |data| {
            data.get_or_insert_with(Vec::new).as_mut_slice()
        })
    }
}

impl Clone for PinnedBlock {
    fn clone(&self) -> Self {
        self.block.add_pin();
        Self { block: Arc::clone(&self.block), handle: self.handle }
    }
}

impl Drop for PinnedBlock {
    fn drop(&mut self) {
        self.block.drop_pin();
    }
}

impl fmt::Debug for PinnedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBlock")
            .field("handle", &self.handle)
            .field("block", &self.block)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullBand;

    impl RasterBand for NullBand {
        fn block_geometry(&self) -> BlockGeometry {
            BlockGeometry::new(1, 1, DataType::Byte)
        }
        fn block_grid(&self) -> (u32, u32) {
            (1, 1)
        }
        fn write_block(&self, _x: u32, _y: u32, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn record_flush_error(&self, _err: Error) {}
        fn last_flush_error(&self) -> Option<Error> {
            None
        }
        fn clear_flush_error(&self) {}
    }

    fn orphan_block(geometry: BlockGeometry) -> CachedBlock {
        let band: Weak<dyn RasterBand> = Weak::<NullBand>::new();
        CachedBlock::new(band, Weak::new(), 0, 0, geometry).unwrap()
    }

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(DataType::Byte.size_bytes(), 1);
        assert_eq!(DataType::Int16.size_bytes(), 2);
        assert_eq!(DataType::Float32.size_bytes(), 4);
        assert_eq!(DataType::CFloat32.size_bytes(), 8);
        assert_eq!(DataType::CFloat64.size_bytes(), 16);
    }

    #[test]
    fn test_geometry_size() {
        let geometry = BlockGeometry::new(256, 128, DataType::UInt16);
        assert_eq!(geometry.size_bytes().unwrap(), 256 * 128 * 2);

        assert!(BlockGeometry::new(0, 16, DataType::Byte).size_bytes().is_err());
        assert!(BlockGeometry::new(u32::MAX, u32::MAX, DataType::CFloat64).size_bytes().is_err());
    }

    #[test]
    fn test_geometry_size_limit() {
        // 46340^2 is just below i32::MAX, 46341^2 is just above.
        assert_eq!(BlockGeometry::new(46340, 46340, DataType::Byte).size_bytes().unwrap(), 2_147_395_600);
        assert!(matches!(
            BlockGeometry::new(46341, 46341, DataType::Byte).size_bytes(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(BlockGeometry::new(65536, 16384, DataType::UInt16).size_bytes().is_err());
        assert!(BlockGeometry::new(u32::MAX, u32::MAX, DataType::Byte).size_bytes().is_err());
    }

    #[test]
    fn test_dirty_transitions() {
        let block = orphan_block(BlockGeometry::new(2, 2, DataType::Byte));
        assert!(!block.is_dirty());
        assert!(block.mark_dirty());
        assert!(!block.mark_dirty());
        assert!(block.is_dirty());
        assert!(block.mark_clean());
        assert!(!block.mark_clean());
    }

    #[test]
    fn test_write_of_orphan_dirty_block_fails_and_cleans() {
        let block = orphan_block(BlockGeometry::new(2, 2, DataType::Byte));
        block.install_buffer(vec![0; 4]);

        // Clean blocks need no band at all.
        assert!(block.write().is_ok());

        block.mark_dirty();
        assert!(matches!(block.write(), Err(Error::WriteBack { .. })));
        assert!(!block.is_dirty());
    }

    #[test]
    fn test_internalization_claimed_once() {
        let block = orphan_block(BlockGeometry::new(1, 1, DataType::Byte));
        assert!(block.claim_internalization());
        assert!(!block.claim_internalization());
    }

    #[test]
    fn test_pinned_block_clone_and_drop() {
        let block = Arc::new(orphan_block(BlockGeometry::new(4, 1, DataType::Byte)));
        block.install_buffer(vec![0; 4]);
        block.add_pin();
        let pinned = PinnedBlock::from_pinned(Arc::clone(&block), BlockHandle { index: 0, generation: 0 });
        assert_eq!(block.pin_count(), 1);

        let second = pinned.clone();
        assert_eq!(block.pin_count(), 2);

        second.data().copy_from_slice(&[1, 2, 3, 4]);
        drop(second);
        assert_eq!(block.pin_count(), 1);
        assert_eq!(&*pinned.data(), &[1, 2, 3, 4]);

        drop(pinned);
        assert_eq!(block.pin_count(), 0);
    }
}
