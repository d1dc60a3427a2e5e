//! Unwinder recursion guard.
//!
//! The platform unwinder locates unwind tables with `dl_iterate_phdr`. If
//! an allocation inside that enumeration is sampled, the nested
//! `_Unwind_Backtrace` would walk the loader again from inside its own
//! callback. Both symbols are interposed: `dl_iterate_phdr` holds the
//! module-walk fence for its duration, and `_Unwind_Backtrace` stops with
//! `_URC_NORMAL_STOP` while the fence is held.

use crate::guard;
use libc::{c_int, c_void, size_t};
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

/// `_URC_NORMAL_STOP`
pub const URC_NORMAL_STOP: c_int = 4;
/// `_URC_END_OF_STACK`
pub const URC_END_OF_STACK: c_int = 5;

type PhdrCallback = Option<unsafe extern "C" fn(*mut libc::dl_phdr_info, size_t, *mut c_void) -> c_int>;
type DlIteratePhdrFn = unsafe extern "C" fn(PhdrCallback, *mut c_void) -> c_int;
type UnwindBacktraceFn = unsafe extern "C" fn(*mut c_void, *mut c_void) -> c_int;

static NEXT_DL_ITERATE_PHDR: AtomicUsize = AtomicUsize::new(0);
static NEXT_UNWIND_BACKTRACE: AtomicUsize = AtomicUsize::new(0);

fn cached_symbol(cache: &AtomicUsize, name: &std::ffi::CStr) -> Option<usize> {
    match cache.load(Ordering::Acquire) {
        0 => {
            let sym = super::next_symbol(name)? as usize;
            cache.store(sym, Ordering::Release);
            Some(sym)
        }
        sym => Some(sym),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn dl_iterate_phdr(callback: PhdrCallback, data: *mut c_void) -> c_int {
    let Some(sym) = cached_symbol(&NEXT_DL_ITERATE_PHDR, c"dl_iterate_phdr") else {
        return 0;
    };
    let next = unsafe { mem::transmute::<usize, DlIteratePhdrFn>(sym) };

    let _walk = guard::ModuleWalkGuard::enter();
    unsafe { next(callback, data) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn _Unwind_Backtrace(trace: *mut c_void, data: *mut c_void) -> c_int {
    if !guard::unwind_permitted() {
        return URC_NORMAL_STOP;
    }
    let Some(sym) = cached_symbol(&NEXT_UNWIND_BACKTRACE, c"_Unwind_Backtrace") else {
        return URC_END_OF_STACK;
    };
    let next = unsafe { mem::transmute::<usize, UnwindBacktraceFn>(sym) };
    unsafe { next(trace, data) }
}
