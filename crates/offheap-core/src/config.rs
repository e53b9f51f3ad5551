//! Allocator configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which `Platform` implementation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    /// Real syscalls (`mmap`, `pread`, `setrlimit`, ...).
    Os,
    /// Heap-backed regions and in-memory files. For tests and dry runs.
    Memory,
}

impl PlatformKind {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "os" => Some(PlatformKind::Os),
            "memory" | "mem" => Some(PlatformKind::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Hard cap on reserved virtual memory (in bytes). The reservoir must
    /// *never* hold more than this.
    pub budget_bytes: usize,

    /// Size of one superblock region. Size classes whose element is larger
    /// get a region rounded up to fit exactly one page-aligned element.
    pub superblock_bytes: usize,

    /// Ask the platform for huge-page backed regions.
    pub huge_pages: bool,

    /// `mlock` every committed region.
    pub lock_memory: bool,

    /// Directory for per-chunk backing files.
    pub swap_dir: String,

    /// A swap round stops once reservoir occupancy drops below this ratio.
    pub swap_target_ratio: f64,

    /// Superblocks whose usage counter is below this are "cold".
    pub cold_usage_threshold: u64,

    /// Upper bound for every allocation/eviction retry loop.
    pub max_alloc_retries: usize,

    pub platform: PlatformKind,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 1024 * 1024 * 1024, // 1 GiB default
            superblock_bytes: 2 * 1024 * 1024,
            huge_pages: false,
            lock_memory: false,
            swap_dir: "/tmp/offheap-swap".to_string(),
            swap_target_ratio: 0.8,
            cold_usage_threshold: 64,
            max_alloc_retries: 1024,
            platform: PlatformKind::Os,
        }
    }
}

impl AllocatorConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `OFFHEAP_BUDGET_BYTES`: virtual-memory budget in bytes
    /// - `OFFHEAP_SUPERBLOCK_BYTES`: superblock region size
    /// - `OFFHEAP_HUGE_PAGES`, `OFFHEAP_LOCK_MEMORY`: `1`/`true` to enable
    /// - `OFFHEAP_SWAP_DIR`: backing-file directory
    /// - `OFFHEAP_SWAP_TARGET_RATIO`: occupancy target after a swap round
    /// - `OFFHEAP_COLD_USAGE_THRESHOLD`: cold predicate threshold
    /// - `OFFHEAP_MAX_ALLOC_RETRIES`: retry bound
    /// - `OFFHEAP_PLATFORM`: `os` or `memory`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_parse::<usize>("OFFHEAP_BUDGET_BYTES") {
            cfg.budget_bytes = v;
        }

        if let Some(v) = env_parse::<usize>("OFFHEAP_SUPERBLOCK_BYTES") {
            cfg.superblock_bytes = v;
        }

        if let Some(v) = env_flag("OFFHEAP_HUGE_PAGES") {
            cfg.huge_pages = v;
        }

        if let Some(v) = env_flag("OFFHEAP_LOCK_MEMORY") {
            cfg.lock_memory = v;
        }

        if let Ok(s) = std::env::var("OFFHEAP_SWAP_DIR") {
            cfg.swap_dir = s;
        }

        if let Some(v) = env_parse::<f64>("OFFHEAP_SWAP_TARGET_RATIO") {
            cfg.swap_target_ratio = v;
        }

        if let Some(v) = env_parse::<u64>("OFFHEAP_COLD_USAGE_THRESHOLD") {
            cfg.cold_usage_threshold = v;
        }

        if let Some(v) = env_parse::<usize>("OFFHEAP_MAX_ALLOC_RETRIES") {
            cfg.max_alloc_retries = v;
        }

        if let Some(kind) = std::env::var("OFFHEAP_PLATFORM")
            .ok()
            .and_then(|s| PlatformKind::parse(&s))
        {
            cfg.platform = kind;
        }

        cfg
    }

    /// Reject configurations the allocator cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.budget_bytes == 0 {
            return Err(Error::Config("budget_bytes must be > 0".into()));
        }
        if self.superblock_bytes == 0 {
            return Err(Error::Config("superblock_bytes must be > 0".into()));
        }
        if self.superblock_bytes > self.budget_bytes {
            return Err(Error::Config(format!(
                "superblock_bytes {} exceeds budget_bytes {}",
                self.superblock_bytes, self.budget_bytes
            )));
        }
        if !(self.swap_target_ratio > 0.0 && self.swap_target_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "swap_target_ratio {} must be in (0, 1]",
                self.swap_target_ratio
            )));
        }
        if self.max_alloc_retries == 0 {
            return Err(Error::Config("max_alloc_retries must be > 0".into()));
        }
        Ok(())
    }

    /// Parse a JSON document, filling omitted fields from `Default`.
    pub fn from_json(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .and_then(|s| match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}
