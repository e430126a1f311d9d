//! The four interposed libc allocator symbols.
//!
//! Exported with default visibility from a `cdylib` so that loading this
//! library ahead of the target process's own libc (via `LD_PRELOAD`)
//! makes the dynamic linker resolve `malloc`/`calloc`/`realloc`/`free`
//! here instead of in libc itself.

mod libc_fallback;
mod reentry;

use std::ffi::c_void;

use gmetrics_config::config;
use gmetrics_runtime::{context, ReallocOutcome};
use reentry::ReentryGuard;

/// # Safety
/// Standard `malloc` contract: the returned pointer, if non-null, must
/// eventually be passed to `free` (or `realloc`) exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let Some(_guard) = ReentryGuard::try_enter() else {
        return unsafe { libc_fallback::calloc(1, size) };
    };
    if !config().enabled {
        // The interposed malloc zeroes memory even when instrumentation
        // is disabled, by routing through calloc(1, n) — an intentional,
        // documented departure from the standard malloc contract.
        return unsafe { libc_fallback::calloc(1, size) };
    }
    context().malloc(size) as *mut c_void
}

/// # Safety
/// Standard `calloc` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(_guard) = ReentryGuard::try_enter() else {
        return unsafe { libc_fallback::calloc(nmemb, size) };
    };
    if !config().enabled {
        return unsafe { libc_fallback::calloc(nmemb, size) };
    }
    let Some(total) = nmemb.checked_mul(size) else {
        return std::ptr::null_mut();
    };
    context().malloc(total) as *mut c_void
}

/// # Safety
/// Standard `realloc` contract: `ptr` must be null or a pointer
/// previously returned by `malloc`/`calloc`/`realloc` and not yet freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let Some(_guard) = ReentryGuard::try_enter() else {
        return unsafe { libc_fallback::realloc(ptr, size) };
    };
    if !config().enabled {
        return unsafe { libc_fallback::realloc(ptr, size) };
    }
    match context().realloc(ptr as *mut u8, size) {
        ReallocOutcome::Owned(p) => p as *mut c_void,
        ReallocOutcome::Freed => std::ptr::null_mut(),
        ReallocOutcome::NotOwned => unsafe { libc_fallback::realloc(ptr, size) },
    }
}

/// # Safety
/// Standard `free` contract: `ptr` must be null or a pointer previously
/// returned by `malloc`/`calloc`/`realloc` and not yet freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    let Some(_guard) = ReentryGuard::try_enter() else {
        unsafe { libc_fallback::free(ptr) };
        return;
    };
    if !config().enabled {
        unsafe { libc_fallback::free(ptr) };
        return;
    }
    if !context().free(ptr as *mut u8) {
        unsafe { libc_fallback::free(ptr) };
    }
}
