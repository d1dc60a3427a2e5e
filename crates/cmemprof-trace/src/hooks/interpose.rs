//! Symbol interposition.
//!
//! Exports `malloc`, `calloc`, `realloc`, `free`, `valloc`, `aligned_alloc`
//! and `posix_memalign`. Preload the cdylib (or link the rlib first) and
//! every allocation in the process passes through here before reaching the
//! next allocator in link order, found with `dlsym(RTLD_NEXT, ..)`.
//!
//! `dlsym` itself may allocate. Allocations made while the next allocator
//! is unknown (during resolution, or after resolution failed) are served
//! from a static arena, and `free` ignores blocks from it.

use super::arena;
use crate::guard;
use libc::{c_int, c_void, size_t};
use std::cell::Cell;
use std::mem;
use std::ptr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type AlignedAllocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
type PosixMemalignFn = unsafe extern "C" fn(*mut *mut c_void, size_t, size_t) -> c_int;

struct NextAllocator {
    malloc: MallocFn,
    calloc: CallocFn,
    realloc: ReallocFn,
    free: FreeFn,
    valloc: Option<MallocFn>,
    aligned_alloc: Option<AlignedAllocFn>,
    posix_memalign: Option<PosixMemalignFn>,
}

static NEXT: OnceLock<NextAllocator> = OnceLock::new();
static UNRESOLVABLE: AtomicBool = AtomicBool::new(false);

thread_local! {
    static RESOLVING: Cell<bool> = const { Cell::new(false) };
}

fn resolve() -> Option<NextAllocator> {
    use super::next_symbol;

    unsafe {
        Some(NextAllocator {
            malloc: mem::transmute::<*mut c_void, MallocFn>(next_symbol(c"malloc")?),
            calloc: mem::transmute::<*mut c_void, CallocFn>(next_symbol(c"calloc")?),
            realloc: mem::transmute::<*mut c_void, ReallocFn>(next_symbol(c"realloc")?),
            free: mem::transmute::<*mut c_void, FreeFn>(next_symbol(c"free")?),
            valloc: next_symbol(c"valloc").map(|f| mem::transmute::<*mut c_void, MallocFn>(f)),
            aligned_alloc: next_symbol(c"aligned_alloc")
                .map(|f| mem::transmute::<*mut c_void, AlignedAllocFn>(f)),
            posix_memalign: next_symbol(c"posix_memalign")
                .map(|f| mem::transmute::<*mut c_void, PosixMemalignFn>(f)),
        })
    }
}

/// `None` while this thread is resolving, or if resolution failed
#[inline]
fn next_allocator() -> Option<&'static NextAllocator> {
    if let Some(next) = NEXT.get() {
        return Some(next);
    }
    if UNRESOLVABLE.load(Ordering::Relaxed) {
        return None;
    }

    let first = RESOLVING.try_with(|flag| !flag.replace(true)).unwrap_or(false);
    if !first {
        return None;
    }
    let resolved = {
        let _suspended = guard::suspend();
        resolve()
    };
    let _ = RESOLVING.try_with(|flag| flag.set(false));

    match resolved {
        // Racing threads may both resolve; the results are identical.
        Some(next) => Some(NEXT.get_or_init(|| next)),
        None => {
            UNRESOLVABLE.store(true, Ordering::Relaxed);
            None
        }
    }
}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

fn early_malloc(size: size_t) -> *mut c_void {
    arena::alloc(size, arena::MIN_ALIGN)
}

fn early_calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    match nmemb.checked_mul(size) {
        Some(total) => arena::alloc(total, arena::MIN_ALIGN),
        None => ptr::null_mut(),
    }
}

/// Move an arena block into a block from `malloc`
unsafe fn realloc_from_arena(ptr: *mut c_void, size: size_t) -> *mut c_void {
    let moved = unsafe { malloc(size) };
    if !moved.is_null() {
        let len = unsafe { arena::block_size(ptr) }.min(size);
        unsafe { ptr::copy_nonoverlapping(ptr as *const u8, moved as *mut u8, len) };
    }
    moved
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    let Some(next) = next_allocator() else {
        return early_malloc(size);
    };
    super::observe(size);
    unsafe { (next.malloc)(size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    let Some(next) = next_allocator() else {
        return early_calloc(nmemb, size);
    };
    super::observe_calloc(nmemb, size);
    unsafe { (next.calloc)(nmemb, size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    if arena::contains(ptr) {
        return unsafe { realloc_from_arena(ptr, size) };
    }
    match next_allocator() {
        Some(next) => {
            super::observe(size);
            unsafe { (next.realloc)(ptr, size) }
        }
        None if ptr.is_null() => early_malloc(size),
        // A foreign block cannot be resized without its allocator
        None => ptr::null_mut(),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() || arena::contains(ptr) {
        return;
    }
    if let Some(next) = next_allocator() {
        unsafe { (next.free)(ptr) }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn valloc(size: size_t) -> *mut c_void {
    let Some(real) = next_allocator().and_then(|next| next.valloc) else {
        return arena::alloc(size, page_size());
    };
    super::observe(size);
    unsafe { real(size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
    let Some(real) = next_allocator().and_then(|next| next.aligned_alloc) else {
        return arena::alloc(size, alignment);
    };
    super::observe(size);
    unsafe { real(alignment, size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    let Some(real) = next_allocator().and_then(|next| next.posix_memalign) else {
        if !alignment.is_power_of_two() || alignment % mem::size_of::<usize>() != 0 {
            return libc::EINVAL;
        }
        let block = arena::alloc(size, alignment);
        if block.is_null() {
            return libc::ENOMEM;
        }
        unsafe { *memptr = block };
        return 0;
    };
    super::observe(size);
    unsafe { real(memptr, alignment, size) }
}
