//! Allocator on the real OS platform: mmap-backed regions and backing files
//! on disk.
#![cfg(unix)]

use offheap_core::{AllocatorConfig, Platform, PlatformKind};
use offheap_io::{build_platform, OsPlatform};
use offheap_mem::OffHeapAllocator;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

fn swap_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("offheap-{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}

fn os_allocator(dir: &PathBuf, superblocks: usize) -> OffHeapAllocator {
    let platform: Arc<dyn Platform> = Arc::new(OsPlatform::new());
    let page = platform.page_size();
    let config = AllocatorConfig {
        budget_bytes: superblocks * page,
        superblock_bytes: page,
        swap_dir: dir.to_string_lossy().into_owned(),
        platform: PlatformKind::Os,
        ..AllocatorConfig::default()
    };
    OffHeapAllocator::new(config, platform).expect("allocator")
}

#[test]
fn test_eviction_writes_raw_image_and_reloads() {
    let dir = swap_dir("image");
    let alloc = os_allocator(&dir, 8);
    let chunk = alloc.allocate(100).unwrap();
    let data: Vec<u8> = (0..100u8).collect();
    alloc.write(&chunk, 0, &data).unwrap();

    assert!(alloc.evict(&chunk).unwrap());
    let path = chunk.backing().path().to_path_buf();
    assert_eq!(path, dir.join(format!("chunk-{}.bin", chunk.id().get())));
    // Raw slot image at offset 0, element-sized, no header.
    let on_disk = fs::read(&path).unwrap();
    assert_eq!(on_disk.len(), chunk.element_size());
    assert_eq!(&on_disk[..100], &data[..]);

    let mut out = vec![0u8; 100];
    alloc.read(&chunk, 0, &mut out).unwrap();
    assert_eq!(out, data);

    alloc.free(&chunk).unwrap();
    assert!(!path.exists());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_os_swap_under_pressure() {
    let dir = swap_dir("pressure");
    let alloc = os_allocator(&dir, 2);
    let page = alloc.platform().page_size();

    // Three page-sized size classes against room for two.
    let chunks: Vec<_> = (1..=3)
        .map(|i| {
            let chunk = alloc.allocate(page - i * 8).unwrap();
            alloc.write(&chunk, 0, &[i as u8; 16]).unwrap();
            chunk
        })
        .collect();
    assert!(alloc.stats().swap.evictions >= 1);

    for (i, chunk) in chunks.iter().enumerate() {
        let mut out = [0u8; 16];
        alloc.read(chunk, 0, &mut out).unwrap();
        assert_eq!(out, [(i + 1) as u8; 16]);
    }
    for chunk in &chunks {
        alloc.free(chunk).unwrap();
    }
    assert_eq!(alloc.stats().live_chunks, 0);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn test_build_platform_os() {
    let config = AllocatorConfig::default();
    let platform = build_platform(&config).unwrap();
    assert!(platform.page_size().is_power_of_two());
}
