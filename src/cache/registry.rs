//! The LRU registry shared by every band.
//!
//! All live blocks sit in one arena and are threaded into a doubly linked
//! list by slot index, newest at the head. The arena, the list, the running
//! byte total and the budget are guarded by a single lock. Write-back
//! I/O never happens while that lock is held: a victim is unlinked and removed
//! from its directory inside the lock, then written and freed outside it by
//! the thread that removed it.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::block::{BlockHandle, CachedBlock, PinnedBlock};
use super::lock::{LockStats, StateLock};
use crate::config::{CacheConfig, DirectoryMode, LockStrategy};
use crate::{Error, Result};

thread_local! {
    static DIRTY_FLUSH_DISABLED: Cell<u32> = const { Cell::new(0) };
}

/// While alive, evictions started on this thread skip dirty blocks.
///
/// Entered around every write-back so that a band's own I/O, if it goes back
/// through the cache, cannot trigger another write-back from inside the first.
pub struct DirtyFlushGuard {
    // Thread-local state: the guard must be dropped on the thread that made it.
    _not_send: PhantomData<*const ()>,
}

impl DirtyFlushGuard {
    pub(crate) fn enter() -> Self {
        DIRTY_FLUSH_DISABLED.with(|depth| depth.set(depth.get() + 1));
        Self { _not_send: PhantomData }
    }

    /// Whether dirty-block flushing is currently disabled on this thread.
    pub fn is_active() -> bool {
        DIRTY_FLUSH_DISABLED.with(|depth| depth.get() > 0)
    }
}

impl Drop for DirtyFlushGuard {
    fn drop(&mut self) {
        DIRTY_FLUSH_DISABLED.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Statistics for cache performance monitoring.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Total number of directory lookups
    pub lookups: u64,
    /// Number of lookups that returned a pinned block
    pub hits: u64,
    /// Number of lookups that found nothing
    pub misses: u64,
    /// Number of blocks admitted into the registry
    pub admissions: u64,
    /// Number of blocks evicted under memory pressure or explicit flushing
    pub evictions: u64,
    /// Number of write-backs handed to bands
    pub write_backs: u64,
    /// Number of write-backs that failed
    pub write_back_failures: u64,
    /// Number of buffers reused from evicted blocks
    pub recycled_buffers: u64,
    /// Number of allocations that stopped at the eviction cap while over budget
    pub eviction_cap_hits: u64,
    /// Bytes resident when the snapshot was taken
    pub used_bytes: usize,
    /// Budget when the snapshot was taken
    pub budget_bytes: usize,
    /// Blocks resident when the snapshot was taken
    pub resident_blocks: usize,
    /// Registry lock tracing, filled only with contention debugging enabled
    pub lock: LockStats,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    admissions: AtomicU64,
    evictions: AtomicU64,
    write_backs: AtomicU64,
    write_back_failures: AtomicU64,
    recycled_buffers: AtomicU64,
    eviction_cap_hits: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        for counter in [
            &self.lookups,
            &self.hits,
            &self.misses,
            &self.admissions,
            &self.evictions,
            &self.write_backs,
            &self.write_back_failures,
            &self.recycled_buffers,
            &self.eviction_cap_hits,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

struct Entry {
    block: Arc<CachedBlock>,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Everything guarded by the registry lock.
struct LruState {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Most recently used.
    head: Option<u32>,
    /// Least recently used.
    tail: Option<u32>,
    len: usize,
    used_bytes: usize,
    budget_bytes: usize,
}

/// Outcome of removing a specific block on behalf of a directory flush.
pub(crate) enum Removal {
    /// The block was unlinked and unregistered; the caller now owns its teardown.
    Removed(Arc<CachedBlock>),
    /// The handle no longer names a live block.
    Gone,
    /// The block is pinned and stays where it is.
    Pinned,
}

impl LruState {
    fn new(budget_bytes: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            used_bytes: 0,
            budget_bytes,
        }
    }

    fn entry(&self, handle: BlockHandle) -> Option<&Entry> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn entry_at(&mut self, index: u32) -> &mut Entry {
        self.slots[index as usize]
            .entry
            .as_mut()
            .expect("linked slot holds an entry")
    }

    fn handle_at(&self, index: u32) -> BlockHandle {
        BlockHandle { index, generation: self.slots[index as usize].generation }
    }

    fn link_head(&mut self, index: u32) {
        let old_head = self.head;
        {
            let entry = self.entry_at(index);
            entry.prev = None;
            entry.next = old_head;
        }
        match old_head {
            Some(h) => self.entry_at(h).prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
    }

    fn unlink(&mut self, index: u32) {
        let (prev, next) = {
            let entry = self.entry_at(index);
            (entry.prev.take(), entry.next.take())
        };
        match prev {
            Some(p) => self.entry_at(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entry_at(n).prev = prev,
            None => self.tail = prev,
        }
    }

    /// Allocates an arena slot for `block`, links it at the head and counts its bytes.
    ///
    /// Returns `None`, changing nothing, if the byte total would overflow.
    fn insert_head(&mut self, block: Arc<CachedBlock>) -> Option<BlockHandle> {
        let size = block.size_bytes();
        let used_bytes = self.used_bytes.checked_add(size)?;
        let entry = Entry { block, prev: None, next: None };

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].entry = Some(entry);
                index
            }
            None => {
                self.slots.push(Slot { generation: 0, entry: Some(entry) });
                (self.slots.len() - 1) as u32
            }
        };

        self.link_head(index);
        self.len += 1;
        self.used_bytes = used_bytes;
        Some(self.handle_at(index))
    }

    fn touch(&mut self, handle: BlockHandle) -> bool {
        if self.entry(handle).is_none() {
            return false;
        }
        if self.head != Some(handle.index) {
            self.unlink(handle.index);
            self.link_head(handle.index);
        }
        true
    }

    /// Unlinks the block, releases its slot and uncounts its bytes.
    fn detach(&mut self, handle: BlockHandle) -> Option<Arc<CachedBlock>> {
        self.entry(handle)?;
        self.unlink(handle.index);

        let slot = &mut self.slots[handle.index as usize];
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        self.len -= 1;
        self.used_bytes -= entry.block.size_bytes();
        Some(entry.block)
    }

    /// Walks from the tail towards the head for the first block that may go.
    fn find_victim(&self, dirty_only: bool, skip_dirty: bool) -> Option<BlockHandle> {
        let mut cursor = self.tail;
        while let Some(index) = cursor {
            let entry = self.slots[index as usize].entry.as_ref()?;
            cursor = entry.prev;

            if entry.block.pin_count() != 0 {
                continue;
            }
            let dirty = entry.block.is_dirty();
            if (dirty_only && !dirty) || (skip_dirty && dirty) {
                continue;
            }
            return Some(self.handle_at(index));
        }
        None
    }

    /// Detaches the chosen victim and clears its directory slot.
    fn evict_one(&mut self, dirty_only: bool, skip_dirty: bool) -> Option<Arc<CachedBlock>> {
        let handle = self.find_victim(dirty_only, skip_dirty)?;
        let block = self.detach(handle)?;
        block.unregister(handle);
        Some(block)
    }
}

/// The process-wide LRU registry of cached blocks.
///
/// Construct one per process (or per test), wrap it in an `Arc`, and hand it
/// to every [`BandBlockCache`](crate::BandBlockCache).
///
/// # Thread Safety
///
/// Every method takes `&self`; the registry can be shared across threads as
/// `Arc<CacheState>`.
pub struct CacheState {
    lock: StateLock<LruState>,
    max_evictions_per_call: AtomicUsize,
    directory_mode: DirectoryMode,
    counters: Counters,
    #[cfg(test)]
    fail_allocations: std::sync::atomic::AtomicBool,
}

impl CacheState {
    /// Create a new registry from `config`.
    ///
    /// # Examples
    ///
    /// ```
    /// use rastercache::{CacheConfig, CacheState};
    /// use std::sync::Arc;
    ///
    /// // A 64MB cache
    /// let state = Arc::new(CacheState::new(CacheConfig::new().budget_bytes(64 << 20)).unwrap());
    /// assert_eq!(state.used_bytes(), 0);
    /// ```
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        log::debug!(
            "Creating block cache: budget {} bytes, {:?} lock",
            config.budget_bytes,
            config.lock_strategy
        );
        Ok(Self {
            lock: StateLock::new(
                config.lock_strategy,
                config.debug_contention,
                LruState::new(config.budget_bytes),
            ),
            max_evictions_per_call: AtomicUsize::new(config.max_evictions_per_call),
            directory_mode: config.directory_mode,
            counters: Counters::default(),
            #[cfg(test)]
            fail_allocations: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Lock strategy in use.
    pub fn lock_strategy(&self) -> LockStrategy {
        self.lock.strategy()
    }

    pub(crate) fn directory_mode(&self) -> DirectoryMode {
        self.directory_mode
    }

    /// Current byte budget.
    pub fn budget_bytes(&self) -> usize {
        self.lock.with(|s| s.budget_bytes)
    }

    /// Bytes held by resident blocks.
    pub fn used_bytes(&self) -> usize {
        self.lock.with(|s| s.used_bytes)
    }

    /// Number of resident blocks across all bands.
    pub fn resident_blocks(&self) -> usize {
        self.lock.with(|s| s.len)
    }

    /// Sets the per-call eviction cap used by [`CacheState::internalize`].
    pub fn set_max_evictions_per_call(&self, cap: usize) {
        self.max_evictions_per_call.store(cap.max(1), Ordering::Relaxed);
    }

    /// Changes the byte budget.
    ///
    /// A smaller budget takes effect immediately: unpinned blocks are evicted,
    /// oldest first, until usage fits or only pinned blocks remain.
    pub fn set_budget_bytes(&self, budget_bytes: usize) {
        let previous = self.lock.with(|s| std::mem::replace(&mut s.budget_bytes, budget_bytes));
        log::debug!("Cache budget changed from {} to {} bytes", previous, budget_bytes);

        let mut evicted = 0;
        while let Some(block) = self.evict_if_over_budget() {
            self.dispose(block);
            evicted += 1;
        }
        if evicted > 0 {
            log::debug!("Evicted {} blocks to fit the new budget", evicted);
        }
    }

    /// Admits a freshly created block and gives it a buffer.
    ///
    /// The block's size is counted and the block is linked at the head, pinned,
    /// before anything else happens. Then the oldest unpinned blocks are evicted
    /// until usage fits the budget, at most `max_evictions_per_call` of them.
    /// One evicted buffer that is large enough is reused for the new block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if no buffer can be obtained; the block
    /// is then removed again and the byte total restored.
    pub fn internalize(&self, block: Arc<CachedBlock>) -> Result<PinnedBlock> {
        if !block.claim_internalization() {
            return Err(Error::invariant_violation(format!(
                "block ({}, {}) internalized twice",
                block.x(),
                block.y()
            )));
        }

        let size = block.size_bytes();
        block.add_pin();
        let Some(handle) = self.lock.with(|s| s.insert_head(Arc::clone(&block))) else {
            block.drop_pin();
            log::warn!(
                "Cannot admit block ({}, {}): byte total would overflow",
                block.x(),
                block.y()
            );
            return Err(Error::OutOfMemory { bytes: size });
        };
        let pinned = PinnedBlock::from_pinned(block, handle);
        Counters::bump(&self.counters.admissions);

        let cap = self.max_evictions_per_call.load(Ordering::Relaxed);
        let mut recycled: Option<Vec<u8>> = None;
        let mut evicted = 0;

        while evicted < cap {
            let Some(victim) = self.evict_if_over_budget() else {
                break;
            };
            evicted += 1;
            // Failures are already recorded on the victim's band.
            let _ = self.write_back(&victim);

            if let Some(buffer) = victim.take_buffer() {
                if recycled.is_none() && buffer.capacity() >= size {
                    recycled = Some(buffer);
                }
            }
        }

        if evicted == cap {
            let (used, budget) = self.lock.with(|s| (s.used_bytes, s.budget_bytes));
            if used > budget {
                Counters::bump(&self.counters.eviction_cap_hits);
                log::warn!(
                    "Evicted {} blocks in one allocation and cache is still over budget ({} > {} bytes)",
                    evicted,
                    used,
                    budget
                );
            }
        }

        let buffer = match recycled {
            Some(mut buffer) => {
                Counters::bump(&self.counters.recycled_buffers);
                buffer.clear();
                buffer.resize(size, 0);
                buffer
            }
            None => match self.allocate_buffer(size) {
                Ok(buffer) => buffer,
                Err(err) => {
                    log::warn!("Cannot allocate block ({}, {}): {}", pinned.x(), pinned.y(), err);
                    self.lock.with(|s| s.detach(handle));
                    return Err(err);
                }
            },
        };

        pinned.block().install_buffer(buffer);
        Ok(pinned)
    }

    /// Moves a block to the most recently used position.
    pub fn touch(&self, block: &PinnedBlock) {
        self.lock.with(|s| s.touch(block.handle()));
    }

    /// Pins a block by handle, failing if it has been evicted in the meantime.
    ///
    /// Runs under the registry lock, the same lock every eviction scan holds,
    /// so a pin can never be granted to a block that is being removed.
    pub fn take_lock(&self, handle: BlockHandle) -> Option<PinnedBlock> {
        let block = self.lock.with(|s| {
            let block = Arc::clone(&s.entry(handle)?.block);
            block.add_pin();
            s.touch(handle);
            Some(block)
        })?;
        Some(PinnedBlock::from_pinned(block, handle))
    }

    /// Adds one more pin to an already pinned block.
    pub fn add_lock(&self, block: &PinnedBlock) -> PinnedBlock {
        block.clone()
    }

    /// Releases a pin.
    pub fn drop_lock(&self, block: PinnedBlock) {
        drop(block);
    }

    /// Pins and touches `handle` if it still names a live block.
    pub fn safe_lock_block(&self, handle: Option<BlockHandle>) -> Option<PinnedBlock> {
        handle.and_then(|handle| self.take_lock(handle))
    }

    /// Evicts one block, oldest first.
    ///
    /// With `dirty_only` only dirty blocks qualify. Returns whether a block
    /// was evicted.
    pub fn flush_cache_block(&self, dirty_only: bool) -> bool {
        let skip_dirty = DirtyFlushGuard::is_active();
        if dirty_only && skip_dirty {
            return false;
        }

        match self.lock.with(|s| s.evict_one(dirty_only, skip_dirty)) {
            Some(block) => {
                Counters::bump(&self.counters.evictions);
                self.dispose(block);
                true
            }
            None => false,
        }
    }

    /// Writes back and evicts every unpinned dirty block.
    pub fn flush_dirty_blocks(&self) {
        let mut flushed = 0;
        while self.flush_cache_block(true) {
            flushed += 1;
        }
        if flushed > 0 {
            log::debug!("Flushed {} dirty blocks", flushed);
        }
    }

    /// Flushes dirty blocks and drops every unpinned block.
    pub fn shutdown(&self) {
        self.flush_dirty_blocks();
        while self.flush_cache_block(false) {}

        let remaining = self.resident_blocks();
        if remaining > 0 {
            log::warn!("{} pinned blocks still resident at cache shutdown", remaining);
        }
    }

    /// Disables dirty-block eviction on the current thread until the guard drops.
    pub fn disable_dirty_flush() -> DirtyFlushGuard {
        DirtyFlushGuard::enter()
    }

    /// Removes a specific block so that its directory can destroy it.
    pub(crate) fn remove_block(&self, handle: BlockHandle) -> Removal {
        self.lock.with(|s| {
            let Some(entry) = s.entry(handle) else {
                return Removal::Gone;
            };
            if entry.block.pin_count() != 0 {
                return Removal::Pinned;
            }
            match s.detach(handle) {
                Some(block) => {
                    block.unregister(handle);
                    Removal::Removed(block)
                }
                None => Removal::Gone,
            }
        })
    }

    /// Unlinks a block that lost a registration race. The caller's pin is released.
    pub(crate) fn discard(&self, pinned: PinnedBlock) {
        self.lock.with(|s| s.detach(pinned.handle()));
        pinned.block().take_buffer();
    }

    /// Hands a removed block to its band if dirty and counts the outcome.
    pub(crate) fn write_back(&self, block: &CachedBlock) -> Result<()> {
        if !block.is_dirty() {
            return Ok(());
        }
        Counters::bump(&self.counters.write_backs);
        let result = block.write();
        if result.is_err() {
            Counters::bump(&self.counters.write_back_failures);
        }
        result
    }

    pub(crate) fn record_lookup(&self, hit: bool) {
        Counters::bump(&self.counters.lookups);
        Counters::bump(if hit { &self.counters.hits } else { &self.counters.misses });
    }

    fn evict_if_over_budget(&self) -> Option<Arc<CachedBlock>> {
        let skip_dirty = DirtyFlushGuard::is_active();
        let block = self.lock.with(|s| {
            if s.used_bytes <= s.budget_bytes {
                return None;
            }
            s.evict_one(false, skip_dirty)
        })?;
        Counters::bump(&self.counters.evictions);
        log::trace!("Evicting block ({}, {}) under memory pressure", block.x(), block.y());
        Some(block)
    }

    fn allocate_buffer(&self, size: usize) -> Result<Vec<u8>> {
        #[cfg(test)]
        if self.fail_allocations.load(Ordering::Relaxed) {
            return Err(Error::OutOfMemory { bytes: size });
        }
        allocate_buffer(size)
    }

    /// Makes every fresh buffer allocation fail until reset.
    #[cfg(test)]
    pub(crate) fn fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::Relaxed);
    }

    fn dispose(&self, block: Arc<CachedBlock>) {
        let _ = self.write_back(&block);
        block.take_buffer();
    }

    /// Get current cache statistics.
    pub fn stats(&self) -> CacheStats {
        let (used_bytes, budget_bytes, resident_blocks) =
            self.lock.with(|s| (s.used_bytes, s.budget_bytes, s.len));
        let c = &self.counters;
        CacheStats {
            lookups: c.lookups.load(Ordering::Relaxed),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            admissions: c.admissions.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            write_backs: c.write_backs.load(Ordering::Relaxed),
            write_back_failures: c.write_back_failures.load(Ordering::Relaxed),
            recycled_buffers: c.recycled_buffers.load(Ordering::Relaxed),
            eviction_cap_hits: c.eviction_cap_hits.load(Ordering::Relaxed),
            used_bytes,
            budget_bytes,
            resident_blocks,
            lock: self.lock.stats(),
        }
    }

    /// Reset cache statistics to zero.
    pub fn reset_stats(&self) {
        self.counters.reset();
        self.lock.reset_stats();
    }

    /// Checks the list structure and the byte total against the arena.
    pub fn verify(&self) -> Result<()> {
        self.lock.with(|s| {
            let mut count = 0;
            let mut bytes = 0;
            let mut prev = None;
            let mut cursor = s.head;

            while let Some(index) = cursor {
                let entry = s
                    .slots
                    .get(index as usize)
                    .and_then(|slot| slot.entry.as_ref())
                    .ok_or_else(|| {
                        Error::InvariantViolation(format!("list reaches empty slot {}", index))
                    })?;
                if entry.prev != prev {
                    return Err(Error::InvariantViolation(format!(
                        "slot {} has back link {:?}, expected {:?}",
                        index, entry.prev, prev
                    )));
                }
                count += 1;
                bytes += entry.block.size_bytes();
                if count > s.len {
                    return Err(Error::InvariantViolation("list is longer than block count".into()));
                }
                prev = Some(index);
                cursor = entry.next;
            }

            if s.tail != prev {
                return Err(Error::InvariantViolation(format!(
                    "tail is {:?} but list ends at {:?}",
                    s.tail, prev
                )));
            }
            if count != s.len {
                return Err(Error::InvariantViolation(format!(
                    "list holds {} blocks, counter says {}",
                    count, s.len
                )));
            }
            if bytes != s.used_bytes {
                return Err(Error::InvariantViolation(format!(
                    "list holds {} bytes, counter says {}",
                    bytes, s.used_bytes
                )));
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for CacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (used, budget, len) = self.lock.with(|s| (s.used_bytes, s.budget_bytes, s.len));
        f.debug_struct("CacheState")
            .field("lock_strategy", &self.lock_strategy())
            .field("used_bytes", &used)
            .field("budget_bytes", &budget)
            .field("resident_blocks", &len)
            .finish()
    }
}

fn allocate_buffer(size: usize) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(size)
        .map_err(|_| Error::OutOfMemory { bytes: size })?;
    buffer.resize(size, 0);
    Ok(buffer)
}
