//! Per-thread reentrancy fences.
//!
//! Three independent counters, all early-exit checks on the hot path:
//!
//! - **module walk depth**: nonzero while this thread enumerates loaded
//!   modules. Unwinding needs the same loader machinery, so the unwinding
//!   capturer refuses to run (and, with the `unwind-guard` feature,
//!   `_Unwind_Backtrace` itself stops immediately).
//! - **suspend depth**: nonzero while this thread is in a window where
//!   capturing would call into something not ready for it (thread-local
//!   teardown, the hook adapters' own lazy setup, a host runtime's thread
//!   start). The entry point skips profiling entirely.
//! - **in profiler**: set while the entry point runs, so allocations made
//!   by the capturer are never profiled themselves.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static MODULE_WALK_DEPTH: Cell<u32> = const { Cell::new(0) };
    static SUSPEND_DEPTH: Cell<u32> = const { Cell::new(0) };
    static IN_PROFILER: Cell<bool> = const { Cell::new(false) };
}

// Guards are tied to the thread whose counter they bumped.
type NotSend = PhantomData<*const ()>;

/// Marks the current thread as enumerating loaded modules
pub struct ModuleWalkGuard {
    _thread: NotSend,
}

impl ModuleWalkGuard {
    pub fn enter() -> Self {
        enter_module_walk();
        ModuleWalkGuard {
            _thread: PhantomData,
        }
    }
}

impl Drop for ModuleWalkGuard {
    fn drop(&mut self) {
        exit_module_walk();
    }
}

fn enter_module_walk() {
    let _ = MODULE_WALK_DEPTH.try_with(|depth| depth.set(depth.get().saturating_add(1)));
}

fn exit_module_walk() {
    let _ = MODULE_WALK_DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
}

/// Whether the current thread may unwind its stack right now
#[inline]
pub fn unwind_permitted() -> bool {
    MODULE_WALK_DEPTH
        .try_with(|depth| depth.get() == 0)
        .unwrap_or(false)
}

/// Profiling is skipped on the current thread while this is alive
pub struct SuspendGuard {
    _thread: NotSend,
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        resume_current_thread();
    }
}

/// Suspend profiling on the current thread until the guard is dropped.
/// Nests.
pub fn suspend() -> SuspendGuard {
    suspend_current_thread();
    SuspendGuard {
        _thread: PhantomData,
    }
}

/// Unscoped form of [`suspend`], for callers that cannot hold a guard
/// (the C ABI). Must be balanced by [`resume_current_thread`].
pub fn suspend_current_thread() {
    let _ = SUSPEND_DEPTH.try_with(|depth| depth.set(depth.get().saturating_add(1)));
}

pub fn resume_current_thread() {
    let _ = SUSPEND_DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
}

/// True while profiling must be skipped on this thread. A thread whose
/// thread-local storage is gone counts as suspended.
#[inline]
pub fn profiling_suspended() -> bool {
    SUSPEND_DEPTH
        .try_with(|depth| depth.get() != 0)
        .unwrap_or(true)
}

/// Held by the entry point while it captures and records a sample
pub(crate) struct ProfilerEntry {
    _thread: NotSend,
}

impl ProfilerEntry {
    /// `None` if this thread is already inside the profiler
    #[inline]
    pub(crate) fn enter() -> Option<Self> {
        let entered = IN_PROFILER
            .try_with(|flag| !flag.replace(true))
            .unwrap_or(false);
        entered.then_some(ProfilerEntry {
            _thread: PhantomData,
        })
    }
}

impl Drop for ProfilerEntry {
    fn drop(&mut self) {
        let _ = IN_PROFILER.try_with(|flag| flag.set(false));
    }
}

/// A module (executable or shared object) mapped into this process
#[derive(Debug, Clone)]
pub struct LoadedModule<'a> {
    /// Path as reported by the dynamic loader; empty for the main executable
    pub path: &'a std::ffi::CStr,
    /// Load bias: runtime address minus link-time address
    pub base: usize,
    /// Runtime addresses covered by the module's loadable segments
    pub span: std::ops::Range<usize>,
}

impl LoadedModule<'_> {
    pub fn contains(&self, addr: usize) -> bool {
        self.span.contains(&addr)
    }
}

/// Enumerate loaded modules with the module-walk fence held for the whole
/// enumeration. `f` returns `false` to stop early.
#[cfg(target_os = "linux")]
pub fn for_each_loaded_module<F>(mut f: F)
where
    F: FnMut(&LoadedModule<'_>) -> bool,
{
    use std::ffi::CStr;

    unsafe extern "C" fn visit<F>(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut libc::c_void,
    ) -> libc::c_int
    where
        F: FnMut(&LoadedModule<'_>) -> bool,
    {
        let f = unsafe { &mut *(data as *mut F) };
        let info = unsafe { &*info };
        let path = if info.dlpi_name.is_null() {
            c""
        } else {
            unsafe { CStr::from_ptr(info.dlpi_name) }
        };
        let base = info.dlpi_addr as usize;
        let phdrs = if info.dlpi_phdr.is_null() {
            &[][..]
        } else {
            unsafe { std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize) }
        };
        let span = phdrs
            .iter()
            .filter(|phdr| phdr.p_type == libc::PT_LOAD)
            .fold(None::<std::ops::Range<usize>>, |acc, phdr| {
                let start = base.wrapping_add(phdr.p_vaddr as usize);
                let end = start.wrapping_add(phdr.p_memsz as usize);
                Some(match acc {
                    Some(r) => r.start.min(start)..r.end.max(end),
                    None => start..end,
                })
            })
            .unwrap_or(base..base);
        let module = LoadedModule { path, base, span };
        if f(&module) { 0 } else { 1 }
    }

    let _walk = ModuleWalkGuard::enter();
    unsafe {
        libc::dl_iterate_phdr(Some(visit::<F>), &mut f as *mut F as *mut libc::c_void);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn for_each_loaded_module<F>(_f: F)
where
    F: FnMut(&LoadedModule<'_>) -> bool,
{
}
