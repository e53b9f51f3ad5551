//! End-to-end allocator behaviour: relocation, swapping, double free,
//! concurrency, and backing-file failures.

use offheap_core::{AllocatorConfig, PlatformKind};
use offheap_io::MemoryPlatform;
use offheap_mem::{Chunk, Error, OffHeapAllocator, SwapOutcome};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const PAGE: usize = 4096;

fn config(superblocks: usize) -> AllocatorConfig {
    AllocatorConfig {
        budget_bytes: superblocks * PAGE,
        superblock_bytes: PAGE,
        swap_dir: "/swap".to_string(),
        platform: PlatformKind::Memory,
        ..AllocatorConfig::default()
    }
}

fn setup(superblocks: usize) -> (Arc<MemoryPlatform>, Arc<OffHeapAllocator>) {
    let platform = Arc::new(MemoryPlatform::new());
    let alloc = OffHeapAllocator::new(config(superblocks), platform.clone()).expect("allocator");
    (platform, Arc::new(alloc))
}

fn fill(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

fn read_all(alloc: &OffHeapAllocator, chunk: &Chunk) -> Vec<u8> {
    let mut out = vec![0u8; chunk.size()];
    alloc.read(chunk, 0, &mut out).expect("read");
    out
}

#[test]
fn test_relocation_is_transparent() {
    let (_platform, alloc) = setup(16);
    let chunk = alloc.allocate(256).unwrap();
    let pattern = fill(3, 256);
    alloc.write(&chunk, 0, &pattern).unwrap();

    let old = chunk.handle();
    assert!(old.state().dirty);
    assert!(alloc.evict(&chunk).unwrap());
    assert!(!old.state().active);

    assert_eq!(read_all(&alloc, &chunk), pattern);
    let new = chunk.handle();
    assert!(new.is_active());
    assert_ne!(new.owner_id(), old.owner_id());
    assert_eq!(alloc.stats().swap.relocations, 1);

    // A second eviction of the clean copy still reloads the same bytes.
    assert!(alloc.evict(&chunk).unwrap());
    assert_eq!(read_all(&alloc, &chunk), pattern);
    alloc.free(&chunk).unwrap();
}

#[test]
fn test_swap_triggers_when_reservoir_is_full() {
    const K: usize = 4;
    let (platform, alloc) = setup(K);

    // One superblock per size class; the reservoir holds exactly K.
    let chunks: Vec<Chunk> = (1..=K).map(|i| alloc.allocate(i * 8).unwrap()).collect();
    for (i, chunk) in chunks.iter().enumerate() {
        alloc.write(chunk, 0, &fill(i as u8, chunk.size())).unwrap();
    }
    // Keep everything but the first chunk hot.
    for chunk in &chunks[1..] {
        for _ in 0..200 {
            read_all(&alloc, chunk);
        }
    }
    let first = chunks[0].handle();
    assert_eq!(alloc.reservoir().occupancy(), 1.0);
    assert_eq!(alloc.stats().swap.evictions, 0);

    let extra = alloc.allocate((K + 1) * 8).unwrap();
    let stats = alloc.stats();
    assert_eq!(stats.swap.rounds, 1);
    assert_eq!(stats.swap.evictions, 1);
    assert!(!first.is_active(), "coldest superblock should go first");
    assert!(chunks[1..].iter().all(|c| c.handle().is_active()));
    assert_eq!(alloc.reservoir().used_bytes(), K * PAGE);
    assert_eq!(platform.mapped_regions(), K);

    // Everything is still retrievable, relocating as needed.
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(read_all(&alloc, chunk), fill(i as u8, chunk.size()));
    }
    assert_eq!(read_all(&alloc, &extra), vec![0u8; extra.size()]);
    assert!(alloc.stats().swap.relocations >= 1);
    assert!(alloc.reservoir().used_bytes() <= alloc.reservoir().capacity_bytes());
}

#[test]
fn test_explicit_swap_round_reports() {
    let (_platform, alloc) = setup(4);
    let chunks: Vec<Chunk> = (1..=4).map(|i| alloc.allocate(i * 8).unwrap()).collect();
    let SwapOutcome::Completed(report) = alloc.swap() else {
        panic!("no other swapper is running");
    };
    assert_eq!(report.candidates, 4);
    assert_eq!(report.evicted, 1);
    assert!(report.occupancy_before > report.occupancy_after);
    for chunk in &chunks {
        assert_eq!(read_all(&alloc, chunk), vec![0u8; chunk.size()]);
    }
}

#[test]
fn test_out_of_memory_when_nothing_can_be_evicted() {
    let (platform, alloc) = setup(1);
    let chunk = alloc.allocate(64).unwrap();
    alloc.write(&chunk, 0, &[1u8; 64]).unwrap();
    platform.fail_io(true);
    // The only superblock is dirty and cannot be flushed.
    let err = alloc.allocate(128).unwrap_err();
    assert!(matches!(err, Error::OutOfMemory { .. }), "got {err:?}");
    assert!(chunk.handle().is_active());
}

#[test]
fn test_double_free_race_frees_once() {
    let (_platform, alloc) = setup(4);
    for _ in 0..50 {
        let chunk = alloc.allocate(64).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                let chunk = Arc::clone(&chunk);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    alloc.free(&chunk)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let double = results
            .iter()
            .filter(|r| matches!(r, Err(Error::DoubleFree { .. })))
            .count();
        assert_eq!((ok, double), (1, 1));
    }
    assert_eq!(alloc.stats().live_chunks, 0);
    assert_eq!(alloc.reservoir().used_bytes(), 0);
}

#[test]
fn test_concurrent_workload_keeps_data_and_budget() {
    // 12 superblocks of demand against a budget of 8, all live at once.
    let (_platform, alloc) = setup(8);
    let threads = 4;
    let per_thread = 24;
    let corrupt = Arc::new(AtomicUsize::new(0));
    let allocated = Arc::new(Barrier::new(threads));

    let workers: Vec<_> = (0..threads)
        .map(|t| {
            let alloc = Arc::clone(&alloc);
            let corrupt = Arc::clone(&corrupt);
            let allocated = Arc::clone(&allocated);
            thread::spawn(move || {
                let chunks: Vec<Chunk> = (0..per_thread)
                    .map(|_| alloc.allocate(512).unwrap())
                    .collect();
                allocated.wait();
                for round in 0..3u8 {
                    for (n, chunk) in chunks.iter().enumerate() {
                        let seed = (t as u8).wrapping_mul(64) ^ (n as u8) ^ round;
                        alloc.write(chunk, 0, &fill(seed, 512)).unwrap();
                        assert!(alloc.reservoir().used_bytes() <= alloc.reservoir().capacity_bytes());
                    }
                    for (n, chunk) in chunks.iter().enumerate() {
                        let seed = (t as u8).wrapping_mul(64) ^ (n as u8) ^ round;
                        if read_all(&alloc, chunk) != fill(seed, 512) {
                            corrupt.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                let ids: HashSet<_> = chunks.iter().map(|c| c.id()).collect();
                assert_eq!(ids.len(), per_thread);
                chunks
            })
        })
        .collect();
    let held: Vec<Vec<Chunk>> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert_eq!(corrupt.load(Ordering::Relaxed), 0);
    let stats = alloc.stats();
    assert_eq!(stats.live_chunks, threads * per_thread);
    assert!(stats.swap.evictions > 0);
    assert!(stats.swap.relocations > 0);
    assert!(stats.peak_bytes <= stats.budget_bytes);

    for chunk in held.iter().flatten() {
        alloc.free(chunk).unwrap();
    }
    assert_eq!(alloc.stats().live_chunks, 0);
}

#[test]
fn test_flush_failure_keeps_chunk_resident() {
    let (platform, alloc) = setup(4);
    let chunk = alloc.allocate(64).unwrap();
    let data = fill(9, 64);
    alloc.write(&chunk, 0, &data).unwrap();

    platform.fail_io(true);
    assert!(matches!(alloc.evict(&chunk), Err(Error::Backing(_))));
    assert!(chunk.handle().is_active());
    assert_eq!(read_all(&alloc, &chunk), data);
    assert_eq!(alloc.stats().swap.io_failures, 1);
}

#[test]
fn test_reload_failure_keeps_stale_handle_and_recovers() {
    let (platform, alloc) = setup(4);
    let chunk = alloc.allocate(64).unwrap();
    let data = fill(5, 64);
    alloc.write(&chunk, 0, &data).unwrap();
    assert!(alloc.evict(&chunk).unwrap());
    let stale = chunk.handle();
    let used = alloc.reservoir().used_bytes();

    platform.fail_io(true);
    let mut buf = vec![0u8; 64];
    assert!(matches!(alloc.read(&chunk, 0, &mut buf), Err(Error::Backing(_))));
    assert!(Arc::ptr_eq(&stale, &chunk.handle()));
    assert_eq!(alloc.reservoir().used_bytes(), used);

    platform.fail_io(false);
    assert_eq!(read_all(&alloc, &chunk), data);
}

#[test]
fn test_corrupted_backing_file_is_detected() {
    let (platform, alloc) = setup(4);
    let chunk = alloc.allocate(16).unwrap();
    alloc.write(&chunk, 0, b"0123456789abcdef").unwrap();
    alloc.evict(&chunk).unwrap();
    platform.overwrite_file(chunk.backing().path(), b"0123456789abcdeX");

    let mut buf = [0u8; 16];
    assert!(matches!(
        alloc.read(&chunk, 0, &mut buf),
        Err(Error::ChecksumMismatch(_))
    ));
}

#[test]
fn test_free_survives_decommit_failure() {
    let (platform, alloc) = setup(4);
    // A whole page per chunk, so free tries to decommit it.
    let chunk = alloc.allocate(PAGE).unwrap();
    alloc.write(&chunk, 0, &fill(1, PAGE)).unwrap();

    platform.fail_decommit(true);
    alloc.free(&chunk).unwrap();
    let stats = alloc.stats();
    assert_eq!(stats.live_chunks, 0);
    assert_eq!(stats.superblocks, 0);
    assert_eq!(alloc.reservoir().used_bytes(), 0);
    assert!(matches!(alloc.free(&chunk), Err(Error::DoubleFree { .. })));

    // The allocator is still usable afterwards.
    let again = alloc.allocate(PAGE).unwrap();
    assert_eq!(read_all(&alloc, &again), vec![0u8; PAGE]);
}

#[test]
fn test_allocation_waits_out_a_slow_swap_round() {
    let (platform, alloc) = setup(2);
    let a = alloc.allocate(8).unwrap();
    let b = alloc.allocate(16).unwrap();
    alloc.write(&a, 0, &[1u8; 8]).unwrap();
    alloc.write(&b, 0, &[2u8; 16]).unwrap();
    // Each flush now takes far longer than any fixed spin budget.
    platform.set_io_delay(Duration::from_millis(100));

    let first = {
        let alloc = Arc::clone(&alloc);
        thread::spawn(move || alloc.allocate(24))
    };
    thread::sleep(Duration::from_millis(20));
    let second = {
        let alloc = Arc::clone(&alloc);
        thread::spawn(move || alloc.allocate(32))
    };
    let first = first.join().unwrap();
    let second = second.join().unwrap();
    assert!(first.is_ok(), "got {first:?}");
    assert!(second.is_ok(), "got {second:?}");
    assert!(alloc.stats().swap.evictions >= 2);

    platform.set_io_delay(Duration::ZERO);
    assert_eq!(read_all(&alloc, &a), vec![1u8; 8]);
    assert_eq!(read_all(&alloc, &b), vec![2u8; 16]);
}
