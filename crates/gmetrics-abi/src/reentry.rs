//! Guards against the instrumentation's own bookkeeping (creating a
//! store's name `String`, growing the registry `Vec`, ...) recursing
//! back into these same interposed symbols. A nested call — one made
//! while we're already inside `malloc`/`calloc`/`realloc`/`free` on this
//! thread — takes the plain libc fallback instead of running our logic
//! again.

use std::cell::Cell;

thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

pub struct ReentryGuard;

impl ReentryGuard {
    /// Returns `Some(guard)` if this is the outermost call on this
    /// thread, `None` if we're already inside one of the four symbols.
    pub fn try_enter() -> Option<Self> {
        let nested = DEPTH.with(|depth| {
            let current = depth.get();
            depth.set(current + 1);
            current > 0
        });
        if nested {
            DEPTH.with(|depth| depth.set(depth.get() - 1));
            None
        } else {
            Some(ReentryGuard)
        }
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}
