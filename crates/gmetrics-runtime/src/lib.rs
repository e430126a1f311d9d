//! Process-singleton allocator context: store arena, registry, and the
//! per-thread default-store stack the interposed symbols delegate to.

pub mod context;
pub mod registry;
pub mod slab;

pub use context::{context, request_flush, Context, ReallocOutcome, StoreSummary, METRICS_STORE_NAME};
pub use slab::StoreId;
