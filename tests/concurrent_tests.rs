// Concurrent Access Tests for rastercache
// These tests verify thread-safety of the shared registry and the band directories

mod common;

use common::{init_logging, pattern, write_pattern, MemoryBand};
use rand::seq::SliceRandom;
use rand::Rng;
use rastercache::{BandBlockCache, CacheConfig, CacheState, LockStrategy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn shared_state(budget_bytes: usize, strategy: LockStrategy) -> Arc<CacheState> {
    let config = CacheConfig::new()
        .budget_bytes(budget_bytes)
        .lock_strategy(strategy)
        .debug_contention(true);
    Arc::new(CacheState::new(config).unwrap())
}

/// Test that racing misses on one coordinate register exactly one block
#[test]
fn test_racing_creators_register_one_block() {
    init_logging();

    let state = shared_state(1 << 20, LockStrategy::Adaptive);
    let band = MemoryBand::new(8, 8, (4, 4));
    let cache = Arc::new(BandBlockCache::new(Arc::clone(&state), band).unwrap());

    let num_threads = 8;
    let barrier = Arc::new(Barrier::new(num_threads));
    let created = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];

    for _ in 0..num_threads {
        let cache_clone = Arc::clone(&cache);
        let barrier_clone = Arc::clone(&barrier);
        let created_clone = Arc::clone(&created);
        handles.push(thread::spawn(move || {
            barrier_clone.wait();
            let access = cache_clone.get_locked_block(2, 3).unwrap();
            if access.is_created() {
                created_clone.fetch_add(1, Ordering::SeqCst);
            }
            access.into_block().handle()
        }));
    }

    let handles: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert!(handles.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(cache.resident_blocks(), 1);
    assert_eq!(state.resident_blocks(), 1);
    assert_eq!(state.used_bytes(), 64);
    state.verify().unwrap();
}

/// Test that no write is lost when other threads evict a band's blocks
#[test]
fn test_concurrent_bands_lose_no_writes() {
    init_logging();

    for strategy in [LockStrategy::Adaptive, LockStrategy::Recursive, LockStrategy::Spin] {
        // 2x2 byte blocks, room for 40 of them across all bands
        let state = shared_state(4 * 40, strategy);
        let num_threads = 6;
        let grid = 12;

        let bands: Vec<_> = (0..num_threads).map(|_| MemoryBand::new(2, 2, (grid, grid))).collect();
        let mut handles = vec![];

        for band in &bands {
            let state_clone = Arc::clone(&state);
            let band_clone = Arc::clone(band);
            handles.push(thread::spawn(move || {
                let cache = BandBlockCache::new(state_clone, band_clone).unwrap();
                let mut coords: Vec<_> =
                    (0..grid).flat_map(|y| (0..grid).map(move |x| (x, y))).collect();
                coords.shuffle(&mut rand::rng());

                for (x, y) in coords {
                    write_pattern(&cache, x, y);
                }
                cache.flush_cache().unwrap();
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        for band in &bands {
            assert_eq!(band.writes() as u32, grid * grid, "{:?}", strategy);
            for y in 0..grid {
                for x in 0..grid {
                    assert_eq!(band.stored(x, y), Some(vec![pattern(x, y); 4]));
                }
            }
        }

        assert_eq!(state.used_bytes(), 0);
        assert!(state.stats().lock.acquisitions > 0);
        state.verify().unwrap();
    }
}

/// Test random concurrent access to one shared band under memory pressure
#[test]
fn test_shared_band_random_access() {
    init_logging();

    let state = shared_state(64 * 32, LockStrategy::Adaptive);
    let band = MemoryBand::new(8, 8, (100, 100));
    let cache = Arc::new(BandBlockCache::new(Arc::clone(&state), band.clone()).unwrap());

    let num_threads = 8;
    let ops_per_thread = 2000;
    let barrier = Arc::new(Barrier::new(num_threads));
    let mut handles = vec![];

    for _ in 0..num_threads {
        let cache_clone = Arc::clone(&cache);
        let barrier_clone = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let mut rng = rand::rng();
            barrier_clone.wait();

            for _ in 0..ops_per_thread {
                let x = rng.random_range(0..100);
                let y = rng.random_range(0..100);
                let block = cache_clone.get_locked_block(x, y).unwrap().into_block();
                assert_eq!(block.size_bytes(), 64);
                assert_eq!((block.x(), block.y()), (x, y));

                if rng.random_bool(0.3) {
                    block.data()[0] = pattern(x, y);
                    block.mark_dirty();
                } else {
                    let _ = block.data()[0];
                }
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    state.verify().unwrap();
    assert_eq!(cache.resident_blocks(), state.resident_blocks());
    assert!(state.used_bytes() <= state.budget_bytes() + 64 * num_threads);

    let stats = state.stats();
    assert_eq!(stats.lookups, stats.hits + stats.misses);
    assert!(stats.evictions > 0);

    cache.flush_cache().unwrap();
    assert_eq!(state.used_bytes(), 0);
    assert_eq!(cache.dirty_block_count(), 0);
    assert!(band.writes() > 0);
}

/// Test pins held across threads keep blocks resident
#[test]
fn test_pins_shared_across_threads() {
    init_logging();

    let state = shared_state(2, LockStrategy::Spin);
    let band = MemoryBand::unit((16, 1));
    let cache = Arc::new(BandBlockCache::new(Arc::clone(&state), band).unwrap());

    let pinned = cache.get_locked_block(0, 0).unwrap().into_block();
    let barrier = Arc::new(Barrier::new(3));
    let mut handles = vec![];

    for t in 0..2u32 {
        let cache_clone = Arc::clone(&cache);
        let barrier_clone = Arc::clone(&barrier);
        let extra = pinned.clone();
        handles.push(thread::spawn(move || {
            barrier_clone.wait();
            for x in 1..8 {
                drop(cache_clone.get_locked_block(x + t * 8, 0).unwrap());
            }
            drop(extra);
        }));
    }

    barrier.wait();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(pinned.pin_count(), 1);
    let again = cache.lookup(0, 0).expect("pinned block must survive eviction");
    assert_eq!(again.handle(), pinned.handle());
    state.verify().unwrap();
}
