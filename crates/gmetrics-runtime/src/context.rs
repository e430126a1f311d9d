//! The process-singleton context the interposed allocator symbols
//! delegate to. Owns the store arena, the registry, the dedicated-store
//! name counter, and the flush flag; exposes `malloc`/`realloc`/`free`
//! in terms of those pieces.
//!
//! Two independent locks guard the shared state: `registry` (the
//! "allocation_block_stores" lock) guards store identity and
//! address-range metadata, `allocations` (the
//! "allocations" lock) guards block layout inside the arena. Whenever an
//! operation needs both, `registry` is acquired first and `allocations`
//! is acquired while still holding it — never the other way around.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;

use gmetrics_core::{BlockStore, BlockStoreError, StackTrace};
use parking_lot::Mutex;

use crate::registry::{Registry, StoreRecord};
use crate::slab::{Slab, StoreId};

/// Name of the store this process records its own metrics under.
pub const METRICS_STORE_NAME: &str = "metrics";

static CONTEXT: OnceLock<Context> = OnceLock::new();

thread_local! {
    static DEFAULT_STACK: RefCell<Vec<StoreId>> = const { RefCell::new(Vec::new()) };
}

/// Outcome of [`Context::realloc`], distinguishing "handled, possibly with
/// a null OOM result" from "not one of ours — fall back to libc".
pub enum ReallocOutcome {
    Owned(*mut u8),
    Freed,
    NotOwned,
}

/// An owned, point-in-time snapshot of one store's accounting fields —
/// cheap to carry around after the locks that produced it are released.
pub struct StoreSummary {
    pub name: String,
    pub number_of_allocations: usize,
    pub total_bytes_allocated: usize,
    pub creation_stack_trace: Option<String>,
}

pub struct Context {
    allocations: Mutex<Slab>,
    registry: Mutex<Registry>,
    dedicated_counter: AtomicU64,
    flush_flag: AtomicBool,
}

/// Returns the process-wide context, creating the metrics store on first
/// call.
pub fn context() -> &'static Context {
    CONTEXT.get_or_init(Context::init)
}

/// Sets the async-signal-safe flush flag. Intended to be called from a
/// `SIGUSR1` handler and nowhere else performance-sensitive.
pub fn request_flush() {
    context().flush_flag.store(true, Ordering::Relaxed);
}

impl Context {
    /// Builds a fresh, independent context rather than reaching for the
    /// process singleton. Exists for integration tests that want their
    /// own arena instead of sharing state with every other test in the
    /// process.
    pub fn new_for_testing() -> Self {
        Self::init()
    }

    fn init() -> Self {
        let config = gmetrics_config::config();
        let context = Self {
            allocations: Mutex::new(Slab::with_capacity(config.max_allocation_block_stores)),
            registry: Mutex::new(Registry::new(config.max_allocation_block_stores)),
            dedicated_counter: AtomicU64::new(0),
            flush_flag: AtomicBool::new(false),
        };
        // The metrics store is created eagerly so registry order (and so
        // CSV snapshot order) starts with it.
        let _ = context.create_store(METRICS_STORE_NAME, config.default_allocation_block_store_size, false, None);
        context
    }

    /// Peeks the flush flag without clearing it — every metric file's
    /// `end_record` during one tick should see the same value.
    pub fn flush_requested(&self) -> bool {
        self.flush_flag.load(Ordering::Relaxed)
    }

    /// Clears the flush flag. Called once, after a whole tick's batch of
    /// handlers has run.
    pub fn clear_flush_requested(&self) {
        self.flush_flag.store(false, Ordering::Relaxed);
    }

    /// Allocates `size` bytes, routing oversized requests into their own
    /// dedicated store. Returns null on failure, exactly like `malloc`.
    pub fn malloc(&self, size: usize) -> *mut u8 {
        let config = gmetrics_config::config();
        if size >= config.dedicated_threshold {
            return self.allocate_dedicated(size);
        }
        let Some(store_id) = self.current_thread_default_store() else {
            return std::ptr::null_mut();
        };
        let mut allocations = self.allocations.lock();
        allocations.get_mut(store_id).and_then(|store| store.allocate(size, None)).unwrap_or(std::ptr::null_mut())
    }

    /// Resizes an owned allocation, or reports that `payload` belongs to
    /// no store so the caller can fall back to libc.
    pub fn realloc(&self, payload: *mut u8, size: usize) -> ReallocOutcome {
        if payload.is_null() {
            return ReallocOutcome::Owned(self.malloc(size));
        }
        let addr = payload as usize;
        let mut registry = self.registry.lock();
        let Some(pos) = registry.find_owning(addr) else {
            return ReallocOutcome::NotOwned;
        };
        let id = registry.records[pos].id;
        let is_dedicated = registry.records[pos].is_dedicated;

        let mut allocations = self.allocations.lock();
        let Some(store) = allocations.get_mut(id) else {
            return ReallocOutcome::NotOwned;
        };
        let result = store.reallocate(payload, size);
        let became_empty = is_dedicated && store.is_empty();
        if became_empty {
            let removed = allocations.remove(id);
            registry.records.remove(pos);
            drop(allocations);
            drop(registry);
            if let Some(store) = removed {
                store.free();
            }
        }
        match result {
            Some(ptr) => ReallocOutcome::Owned(ptr),
            None => ReallocOutcome::Freed,
        }
    }

    /// Frees an owned allocation. Returns `false` if `payload` belongs to
    /// no store, so the caller can fall back to libc.
    pub fn free(&self, payload: *mut u8) -> bool {
        if payload.is_null() {
            return true;
        }
        let addr = payload as usize;
        let mut registry = self.registry.lock();
        let Some(pos) = registry.find_owning(addr) else {
            return false;
        };
        let id = registry.records[pos].id;
        let is_dedicated = registry.records[pos].is_dedicated;

        let mut allocations = self.allocations.lock();
        let mut became_empty = false;
        if let Some(store) = allocations.get_mut(id) {
            store.deallocate(payload);
            became_empty = is_dedicated && store.is_empty();
        }
        if became_empty {
            let removed = allocations.remove(id);
            registry.records.remove(pos);
            drop(allocations);
            drop(registry);
            if let Some(store) = removed {
                store.free();
            }
        }
        true
    }

    /// Visits every live store (name, store) under both locks, in
    /// registry order. `visit` should be cheap: both locks are held for
    /// its entire duration, so this is the wrong tool for anything that
    /// does file or network I/O per store — use [`Context::store_summaries`]
    /// for that instead.
    pub fn snapshot<F: FnMut(&str, &BlockStore)>(&self, mut visit: F) {
        let registry = self.registry.lock();
        let allocations = self.allocations.lock();
        for record in registry.records.iter() {
            if let Some(store) = allocations.get(record.id) {
                visit(&record.name, store);
            }
        }
    }

    /// Collects an owned summary of every live, mapped store, in registry
    /// order, releasing both locks before returning. Slow per-store work
    /// (gzip writes, ...) should run over the returned `Vec`, not inside a
    /// lock — unlike `snapshot`, this never holds `allocations` while the
    /// caller is doing that work.
    pub fn store_summaries(&self) -> Vec<StoreSummary> {
        let registry = self.registry.lock();
        let allocations = self.allocations.lock();
        registry
            .records
            .iter()
            .filter_map(|record| {
                let store = allocations.get(record.id)?;
                if !store.is_mapped() {
                    return None;
                }
                Some(StoreSummary {
                    name: record.name.clone(),
                    number_of_allocations: store.number_of_allocations(),
                    total_bytes_allocated: store.total_bytes_allocated(),
                    creation_stack_trace: store.creation_stack_trace().map(|trace| trace.output().to_string()),
                })
            })
            .collect()
    }

    /// Returns the non-empty allocation labels for the named store, or
    /// `None` if no such store is currently live. Used for the metrics
    /// store's own periodic allocation-label dump.
    pub fn allocation_labels(&self, store_name: &str) -> Option<Vec<String>> {
        let registry = self.registry.lock();
        let id = registry.records.iter().find(|record| record.name == store_name)?.id;
        drop(registry);

        let allocations = self.allocations.lock();
        let store = allocations.get(id)?;
        if !store.is_mapped() {
            return None;
        }
        Some(
            store
                .iter_allocations()
                .map(|(_, header)| header.label().to_string())
                .filter(|label| !label.is_empty())
                .collect(),
        )
    }

    /// Creates a store named `name` and pushes it onto this thread's
    /// default-store stack, so subsequent `malloc` calls on this thread
    /// land there until a matching `pop_default_allocation_block_store`.
    pub fn push_default_allocation_block_store(&self, name: &str) -> Result<(), BlockStoreError> {
        let config = gmetrics_config::config();
        let trace = StackTrace::capture(0, config.stack_trace_size, ";");
        let id = self.create_store(name, config.default_allocation_block_store_size, false, Some(trace))?;
        DEFAULT_STACK.with(|stack| stack.borrow_mut().push(id));
        Ok(())
    }

    /// Pops the most recently pushed default store, reverting this
    /// thread's allocations to whatever was active before it (or to a
    /// freshly created per-thread default on the next allocation, if the
    /// stack is now empty). A no-op if nothing has been pushed.
    pub fn pop_default_allocation_block_store(&self) {
        DEFAULT_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }

    fn current_thread_default_store(&self) -> Option<StoreId> {
        if let Some(id) = DEFAULT_STACK.with(|stack| stack.borrow().last().copied()) {
            return Some(id);
        }
        let config = gmetrics_config::config();
        let name = format!("thread-{}", thread_id());
        let trace = StackTrace::capture(4, 5, ";");
        let id = self
            .create_store(&name, config.default_allocation_block_store_size, false, Some(trace))
            .ok()?;
        DEFAULT_STACK.with(|stack| stack.borrow_mut().push(id));
        Some(id)
    }

    fn allocate_dedicated(&self, size: usize) -> *mut u8 {
        let config = gmetrics_config::config();
        let counter = self.dedicated_counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("allocation-{size}-{counter}");
        let trace = StackTrace::capture(0, 5, ";");
        let Ok(id) = self.create_store(&name, config.default_allocation_block_store_size, true, Some(trace)) else {
            return std::ptr::null_mut();
        };

        let mut allocations = self.allocations.lock();
        let ptr = allocations.get_mut(id).and_then(|store| store.allocate(size, None)).unwrap_or(std::ptr::null_mut());
        if ptr.is_null() {
            drop(allocations);
            self.remove_empty_dedicated(id);
        }
        ptr
    }

    fn remove_empty_dedicated(&self, id: StoreId) {
        let mut registry = self.registry.lock();
        registry.records.retain(|record| record.id != id);
        let mut allocations = self.allocations.lock();
        if let Some(store) = allocations.remove(id) {
            drop(allocations);
            drop(registry);
            store.free();
        }
    }

    fn create_store(
        &self,
        name: &str,
        size: usize,
        dedicated: bool,
        trace: Option<StackTrace>,
    ) -> Result<StoreId, BlockStoreError> {
        let mut registry = self.registry.lock();
        if registry.is_full() {
            return Err(BlockStoreError::MappingFailed("store arena at capacity".to_string()));
        }
        let mut store = BlockStore::new(name, size)?;
        store.set_dedicated(dedicated);
        if let Some(trace) = trace {
            store.set_creation_stack_trace(trace);
        }
        let base_addr = store.base_addr().unwrap_or(0);

        let mut allocations = self.allocations.lock();
        let id = allocations.insert(store);
        drop(allocations);

        registry.records.push(StoreRecord { id, name: name.to_string(), base_addr, size, is_dedicated: dedicated });
        Ok(id)
    }
}

fn thread_id() -> i32 {
    unsafe { libc::gettid() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_then_free_round_trips() {
        let config_guard = gmetrics_config::config();
        let _ = config_guard; // force config resolution before the context does

        let context = Context::init();
        let ptr = context.malloc(128);
        assert!(!ptr.is_null());
        assert!(context.free(ptr));
    }

    #[test]
    fn free_of_unowned_pointer_reports_not_owned() {
        let context = Context::init();
        let bogus = 0x1000 as *mut u8;
        assert!(!context.free(bogus));
    }

    #[test]
    fn realloc_of_unowned_pointer_reports_not_owned() {
        let context = Context::init();
        let bogus = 0x1000 as *mut u8;
        assert!(matches!(context.realloc(bogus, 64), ReallocOutcome::NotOwned));
    }

    #[test]
    fn pushing_a_default_store_redirects_subsequent_allocations_there() {
        let context = Context::init();
        context.push_default_allocation_block_store("pushed-store").unwrap();

        let ptr = context.malloc(64);
        assert!(!ptr.is_null());

        let mut owner = None;
        context.snapshot(|name, store| {
            if store.has_allocation(ptr) {
                owner = Some(name.to_string());
            }
        });
        assert_eq!(owner.as_deref(), Some("pushed-store"));

        context.free(ptr);
        context.pop_default_allocation_block_store();
    }

    #[test]
    fn popping_with_nothing_pushed_is_a_no_op() {
        let context = Context::init();
        context.pop_default_allocation_block_store();
        let ptr = context.malloc(64);
        assert!(!ptr.is_null());
        assert!(context.free(ptr));
    }

    #[test]
    fn dedicated_store_disappears_once_freed() {
        let context = Context::init();
        let threshold = gmetrics_config::config().dedicated_threshold;
        let ptr = context.malloc(threshold + 1);
        assert!(!ptr.is_null());
        let mut seen_before = 0;
        context.snapshot(|_, _| seen_before += 1);
        assert!(context.free(ptr));
        let mut seen_after = 0;
        context.snapshot(|_, _| seen_after += 1);
        assert_eq!(seen_after, seen_before - 1);
    }
}
