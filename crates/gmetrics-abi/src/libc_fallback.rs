//! Lazily resolves the real libc allocator symbols via the dynamic
//! linker (`dlsym(RTLD_NEXT, ...)`) rather than versioned linker symbol
//! aliasing, so the lookup works regardless of which glibc version is
//! loaded underneath us.

use std::ffi::{c_void, CStr};
use std::sync::OnceLock;

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);

static REAL_MALLOC: OnceLock<MallocFn> = OnceLock::new();
static REAL_CALLOC: OnceLock<CallocFn> = OnceLock::new();
static REAL_REALLOC: OnceLock<ReallocFn> = OnceLock::new();
static REAL_FREE: OnceLock<FreeFn> = OnceLock::new();

/// # Safety
/// `name` must name a symbol whose signature matches `F`.
unsafe fn resolve<F: Copy>(name: &CStr) -> F {
    let symbol = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    assert!(!symbol.is_null(), "gmetrics-abi: {name:?} not found via RTLD_NEXT");
    unsafe { std::mem::transmute_copy(&symbol) }
}

pub(crate) unsafe fn malloc(size: usize) -> *mut c_void {
    let real = *REAL_MALLOC.get_or_init(|| unsafe { resolve(c"malloc") });
    unsafe { real(size) }
}

pub(crate) unsafe fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let real = *REAL_CALLOC.get_or_init(|| unsafe { resolve(c"calloc") });
    unsafe { real(nmemb, size) }
}

pub(crate) unsafe fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let real = *REAL_REALLOC.get_or_init(|| unsafe { resolve(c"realloc") });
    unsafe { real(ptr, size) }
}

pub(crate) unsafe fn free(ptr: *mut c_void) {
    let real = *REAL_FREE.get_or_init(|| unsafe { resolve(c"free") });
    unsafe { real(ptr) }
}
