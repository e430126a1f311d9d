//! Small CLI for exercising the block store by hand: print the resolved
//! configuration, or throw a scripted allocate/free/realloc workload at a
//! standalone store and report how it came out.

use clap::{Parser, Subcommand};
use gmetrics_core::BlockStore;
use gmetrics_harness::structured_log::{LogLevel, StructuredLogger};

#[derive(Parser)]
#[command(name = "gmetrics-harness", about = "Drive the instrumented allocator by hand")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the configuration that would be resolved from the environment.
    Inspect,
    /// Run a scripted allocate/free/realloc sequence against a standalone
    /// block store and report the resulting occupancy.
    Scenario {
        /// Number of 64-byte blocks backing the store.
        #[arg(long, default_value_t = 4096)]
        blocks: u32,
        /// Number of random allocate/free operations to perform.
        #[arg(long, default_value_t = 500)]
        operations: u32,
    },
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Inspect => inspect(),
        Command::Scenario { blocks, operations } => scenario(blocks, operations),
    }
}

fn inspect() {
    let config = gmetrics_config::config();
    println!("{config:#?}");
}

fn scenario(blocks: u32, operations: u32) {
    let mut logger = StructuredLogger::new(std::io::stdout());
    let size = blocks as usize * gmetrics_core::BLOCK_SIZE;
    let mut store = BlockStore::new("harness-scenario", size).expect("store should map");
    logger.log(LogLevel::Info, "store_created", &format!("blocks={blocks}"));

    let mut live: Vec<*mut u8> = Vec::new();
    let mut rng_state: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut next_random = || {
        rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        rng_state
    };

    for i in 0..operations {
        let draw = next_random();
        let wants_allocation = live.is_empty() || (draw >> 33) % 3 != 2;
        if wants_allocation {
            let size = ((draw >> 16) % 512 + 1) as usize;
            match store.allocate(size, Some(&format!("op-{i}"))) {
                Some(ptr) => live.push(ptr),
                None => logger.log(LogLevel::Warn, "allocation_failed", &format!("size={size}")),
            }
        } else {
            let idx = (draw as usize) % live.len();
            let ptr = live.remove(idx);
            store.deallocate(ptr);
        }
    }

    logger.log(
        LogLevel::Info,
        "scenario_complete",
        &format!("live_allocations={} bytes_allocated={}", live.len(), store.total_bytes_allocated()),
    );
    store.free();
}
