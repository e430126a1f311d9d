//! Gzipped CSV metrics files, the tick driver, the `SIGUSR1` flush
//! request, and the built-in allocation-store snapshot handler.

pub mod allocation_snapshot;
pub mod metrics_file;
pub mod sigusr1;
pub mod tick;

pub use allocation_snapshot::AllocationSnapshotHandler;
pub use metrics_file::MetricsFile;
pub use tick::TickDriver;
