//! Allocation hooks: every route by which an allocation reaches the
//! profiler.
//!
//! - [`ProfilingAllocator`], a `GlobalAlloc` wrapper for Rust programs
//! - `wrap`: `__wrap_*` functions for `-Wl,--wrap=malloc` style linking
//! - `interpose`: exported `malloc` and friends that forward to the next
//!   definition in link order (`LD_PRELOAD`)
//! - `unwind`: interposed `dl_iterate_phdr`/`_Unwind_Backtrace` that make the
//!   unwinder stop instead of recursing into the dynamic loader
//!
//! Hooks report the requested size and then delegate. They never change the
//! outcome of the allocation; interposed allocations made before the next
//! allocator is known come from a static arena.

use core::alloc::{GlobalAlloc, Layout};
use std::alloc::System;

#[cfg(all(feature = "interpose", unix))]
mod arena;
#[cfg(all(feature = "interpose", unix))]
pub mod interpose;
#[cfg(all(feature = "unwind-guard", target_os = "linux"))]
pub mod unwind;
#[cfg(feature = "wrap")]
pub mod wrap;

/// Report an allocation of `size` bytes to the process-wide profiler, if
/// there is one.
#[inline(always)]
pub(crate) fn observe(size: usize) {
    if let Some(profiler) = crate::global() {
        profiler.profile_allocation(size);
    }
}

#[inline(always)]
pub(crate) fn observe_calloc(nmemb: usize, size: usize) {
    if let Some(profiler) = crate::global() {
        profiler.profile_calloc(nmemb, size);
    }
}

/// Look up the next definition of `name` after this object in link order
#[cfg(all(unix, any(feature = "interpose", feature = "unwind-guard")))]
pub(crate) fn next_symbol(name: &std::ffi::CStr) -> Option<*mut libc::c_void> {
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    (!sym.is_null()).then_some(sym)
}

/// A global allocator that reports to the process-wide profiler before
/// delegating to `A`.
///
/// Without the `heap` feature it is a plain passthrough.
///
/// ```rust,ignore
/// #[global_allocator]
/// static ALLOC: cmemprof_trace::ProfilingAllocator = cmemprof_trace::ProfilingAllocator::new();
/// ```
pub struct ProfilingAllocator<A = System> {
    inner: A,
}

impl ProfilingAllocator<System> {
    pub const fn new() -> Self {
        ProfilingAllocator { inner: System }
    }
}

impl<A> ProfilingAllocator<A> {
    /// Profile allocations made through another allocator
    pub const fn wrapping(inner: A) -> Self {
        ProfilingAllocator { inner }
    }
}

impl Default for ProfilingAllocator<System> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "heap")]
#[inline(always)]
fn record(size: usize) {
    observe(size);
}

#[cfg(not(feature = "heap"))]
#[inline(always)]
fn record(_size: usize) {}

unsafe impl<A: GlobalAlloc> GlobalAlloc for ProfilingAllocator<A> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        record(layout.size());
        unsafe { self.inner.alloc(layout) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.inner.dealloc(ptr, layout) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        record(layout.size());
        unsafe { self.inner.alloc_zeroed(layout) }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        record(new_size);
        unsafe { self.inner.realloc(ptr, layout, new_size) }
    }
}
