//! Link-time wrappers.
//!
//! Link the final program with `-Wl,--wrap=malloc,--wrap=calloc,...` and the
//! linker routes every call to `malloc` into `__wrap_malloc`, while
//! `__real_malloc` names the original. No runtime symbol lookup is needed,
//! so the lazy-resolution hazard of [`super::interpose`] does not exist here.
//!
//! Every `__real_*` symbol referenced below must be produced by a matching
//! `--wrap` flag, otherwise linking fails.

use libc::{c_int, c_void, size_t};

unsafe extern "C" {
    fn __real_malloc(size: size_t) -> *mut c_void;
    fn __real_calloc(nmemb: size_t, size: size_t) -> *mut c_void;
    fn __real_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void;
    fn __real_valloc(size: size_t) -> *mut c_void;
    fn __real_aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void;
    fn __real_posix_memalign(memptr: *mut *mut c_void, alignment: size_t, size: size_t)
    -> c_int;
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn __wrap_malloc(size: size_t) -> *mut c_void {
    super::observe(size);
    unsafe { __real_malloc(size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn __wrap_calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    super::observe_calloc(nmemb, size);
    unsafe { __real_calloc(nmemb, size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn __wrap_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    super::observe(size);
    unsafe { __real_realloc(ptr, size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn __wrap_valloc(size: size_t) -> *mut c_void {
    super::observe(size);
    unsafe { __real_valloc(size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn __wrap_aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
    super::observe(size);
    unsafe { __real_aligned_alloc(alignment, size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn __wrap_posix_memalign(
    memptr: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    super::observe(size);
    unsafe { __real_posix_memalign(memptr, alignment, size) }
}
