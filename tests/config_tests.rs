//! Configuration loading and validation

use offheap_core::{AllocatorConfig, PlatformKind};
use offheap_io::MemoryPlatform;
use offheap_mem::{Error, OffHeapAllocator};
use std::sync::Arc;

#[test]
fn test_defaults_are_valid() {
    let config = AllocatorConfig::default();
    config.validate().unwrap();
    assert_eq!(config.budget_bytes, 1 << 30);
    assert_eq!(config.superblock_bytes, 2 << 20);
    assert_eq!(config.platform, PlatformKind::Os);
}

#[test]
fn test_partial_json_fills_defaults() {
    let config = AllocatorConfig::from_json(
        r#"{"budget_bytes": 1048576, "swap_dir": "/var/tmp/x", "platform": "memory"}"#,
    )
    .unwrap();
    assert_eq!(config.budget_bytes, 1 << 20);
    assert_eq!(config.swap_dir, "/var/tmp/x");
    assert_eq!(config.platform, PlatformKind::Memory);
    assert_eq!(config.cold_usage_threshold, 64);
}

#[test]
fn test_invalid_config_rejected_by_allocator() {
    let config = AllocatorConfig {
        budget_bytes: 4096,
        superblock_bytes: 8192,
        ..AllocatorConfig::default()
    };
    let err = OffHeapAllocator::new(config, Arc::new(MemoryPlatform::new())).unwrap_err();
    assert!(matches!(err, Error::Platform(offheap_core::Error::Config(_))));

    let bad_ratio = AllocatorConfig {
        swap_target_ratio: 1.5,
        ..AllocatorConfig::default()
    };
    assert!(bad_ratio.validate().is_err());
}

#[test]
fn test_config_serializes_round_trip_fields() {
    let config = AllocatorConfig {
        huge_pages: true,
        ..AllocatorConfig::default()
    };
    let json = serde_json::to_value(&config).unwrap();
    assert_eq!(json["huge_pages"], true);
    assert_eq!(json["platform"], "os");
}
