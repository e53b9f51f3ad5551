use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use offheap_core::id::SlabId;
use offheap_core::{AllocatorConfig, PlatformKind};
use offheap_io::MemoryPlatform;
use offheap_mem::{OffHeapAllocator, Slab, SlotStack};
use std::sync::Arc;

fn bench_slot_stack(c: &mut Criterion) {
    let stack = SlotStack::new(1024);
    for slot in 0..1024 {
        stack.push(slot);
    }
    c.bench_function("slot_stack_pop_push", |b| {
        b.iter(|| {
            let slot = stack.pop().unwrap();
            stack.push(black_box(slot));
        })
    });
}

fn bench_slab(c: &mut Criterion) {
    c.bench_function("slab_allocate_free_256", |b| {
        b.iter_batched(
            || Slab::new(SlabId::new(1), 0x10000, 64 * 1024, 64).unwrap(),
            |slab| {
                let addrs: Vec<_> = (0..256).filter_map(|_| slab.allocate()).collect();
                for addr in addrs {
                    slab.free(addr).unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_chunk_io(c: &mut Criterion) {
    let config = AllocatorConfig {
        budget_bytes: 64 << 20,
        superblock_bytes: 1 << 20,
        platform: PlatformKind::Memory,
        ..AllocatorConfig::default()
    };
    let alloc = OffHeapAllocator::new(config, Arc::new(MemoryPlatform::new())).unwrap();
    let chunk = alloc.allocate(4096).unwrap();
    let data = vec![7u8; 4096];
    let mut out = vec![0u8; 4096];

    c.bench_function("chunk_write_read_4k", |b| {
        b.iter(|| {
            alloc.write(&chunk, 0, black_box(&data)).unwrap();
            alloc.read(&chunk, 0, &mut out).unwrap();
        })
    });

    c.bench_function("chunk_allocate_free_64", |b| {
        b.iter(|| {
            let chunk = alloc.allocate(black_box(64)).unwrap();
            alloc.free(&chunk).unwrap();
        })
    });
}

criterion_group!(benches, bench_slot_stack, bench_slab, bench_chunk_io);
criterion_main!(benches);
