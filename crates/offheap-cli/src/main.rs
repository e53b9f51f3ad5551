//! offheap CLI: stress the allocator, inspect limits, print configuration.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use offheap_core::prelude::{AllocatorConfig, Platform, PlatformKind, ResourceKind};
use offheap_io::build_platform;
use offheap_mem::{Chunk, OffHeapAllocator};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "offheap")]
#[command(about = "Off-heap slab allocator with superblock swapping", long_about = None)]
struct Cli {
    /// Platform implementation (overrides OFFHEAP_PLATFORM)
    #[arg(long, global = true, value_enum)]
    platform: Option<PlatformArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum PlatformArg {
    Os,
    Memory,
}

impl From<PlatformArg> for PlatformKind {
    fn from(arg: PlatformArg) -> Self {
        match arg {
            PlatformArg::Os => PlatformKind::Os,
            PlatformArg::Memory => PlatformKind::Memory,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a multi-threaded allocate/write/read/verify workload
    Stress {
        /// Worker threads
        #[arg(long, default_value_t = 4)]
        threads: usize,

        /// Chunks each thread keeps alive
        #[arg(long, default_value_t = 256)]
        chunks: usize,

        /// Chunk size in bytes
        #[arg(long, default_value_t = 4096)]
        chunk_size: usize,

        /// Verify passes over every chunk
        #[arg(long, default_value_t = 4)]
        rounds: usize,

        /// Virtual-memory budget in bytes (overrides config)
        #[arg(long)]
        budget: Option<usize>,

        /// Superblock size in bytes (overrides config)
        #[arg(long)]
        superblock: Option<usize>,

        /// Directory for backing files (overrides config)
        #[arg(long)]
        swap_dir: Option<String>,
    },

    /// Print the process resource limits the allocator consults
    Limits,

    /// Print the effective configuration as JSON
    Config,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = AllocatorConfig::from_env();
    if let Some(platform) = cli.platform {
        config.platform = platform.into();
    }

    let result = match cli.command {
        Commands::Stress {
            threads,
            chunks,
            chunk_size,
            rounds,
            budget,
            superblock,
            swap_dir,
        } => {
            if let Some(budget) = budget {
                config.budget_bytes = budget;
            }
            if let Some(superblock) = superblock {
                config.superblock_bytes = superblock;
            }
            if let Some(dir) = swap_dir {
                config.swap_dir = dir;
            }
            run_stress(config, threads, chunks, chunk_size, rounds)
        }
        Commands::Limits => show_limits(&config),
        Commands::Config => show_config(&config),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Byte `i` of chunk `n` written by thread `t` in round `r`.
fn pattern(t: usize, n: usize, r: usize, i: usize) -> u8 {
    (t.wrapping_mul(31) ^ n.wrapping_mul(7) ^ r.wrapping_mul(13) ^ i) as u8
}

fn run_stress(
    config: AllocatorConfig,
    threads: usize,
    chunks: usize,
    chunk_size: usize,
    rounds: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let platform = build_platform(&config)?;
    let allocator = Arc::new(OffHeapAllocator::new(config, platform)?);
    let mismatches = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let workers: Vec<_> = (0..threads)
        .map(|t| {
            let allocator = Arc::clone(&allocator);
            let mismatches = Arc::clone(&mismatches);
            thread::spawn(move || -> offheap_mem::Result<()> {
                let mut buf = vec![0u8; chunk_size];
                let held: Vec<Chunk> = (0..chunks)
                    .map(|_| allocator.allocate(chunk_size))
                    .collect::<offheap_mem::Result<_>>()?;
                for r in 0..rounds {
                    for (n, chunk) in held.iter().enumerate() {
                        if r > 0 {
                            allocator.read(chunk, 0, &mut buf)?;
                            if buf.iter().enumerate().any(|(i, &b)| b != pattern(t, n, r - 1, i)) {
                                mismatches.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        buf.iter_mut()
                            .enumerate()
                            .for_each(|(i, b)| *b = pattern(t, n, r, i));
                        allocator.write(chunk, 0, &buf)?;
                    }
                }
                for chunk in &held {
                    allocator.free(chunk)?;
                }
                Ok(())
            })
        })
        .collect();

    for worker in workers {
        worker
            .join()
            .map_err(|_| "stress worker panicked")??;
    }

    let elapsed = started.elapsed();
    let stats = allocator.stats();
    tracing::info!(
        elapsed_ms = elapsed.as_millis() as u64,
        evictions = stats.swap.evictions,
        relocations = stats.swap.relocations,
        "stress run finished"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);

    let bad = mismatches.load(Ordering::Relaxed);
    if bad > 0 {
        return Err(format!("{bad} chunk(s) failed verification").into());
    }
    Ok(())
}

fn show_limits(config: &AllocatorConfig) -> Result<(), Box<dyn std::error::Error>> {
    let platform = build_platform(config)?;
    let fmt = |v: Option<u64>| v.map_or_else(|| "unlimited".to_string(), |v| v.to_string());
    println!("page size: {}", platform.page_size());
    for kind in [ResourceKind::Data, ResourceKind::AddressSpace, ResourceKind::MemLock] {
        let limit = platform.resource_limit(kind)?;
        println!(
            "{:<14} soft={:<20} hard={}",
            kind.to_string(),
            fmt(limit.soft),
            fmt(limit.hard)
        );
    }
    Ok(())
}

fn show_config(config: &AllocatorConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
