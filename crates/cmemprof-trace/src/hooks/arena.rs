//! Static bump arena for allocations made before the next allocator is
//! known.
//!
//! Blocks are never reused, so every block is zeroed. Each block is
//! preceded by its requested size.

use libc::c_void;
use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const ARENA_SIZE: usize = 256 * 1024;
pub const MIN_ALIGN: usize = 16;

#[repr(C, align(16))]
struct Arena(UnsafeCell<[u8; ARENA_SIZE]>);

// Disjoint blocks are handed out through CURSOR.
unsafe impl Sync for Arena {}

static ARENA: Arena = Arena(UnsafeCell::new([0; ARENA_SIZE]));
static CURSOR: AtomicUsize = AtomicUsize::new(0);

fn base() -> usize {
    ARENA.0.get() as usize
}

/// Null if `align` is not a power of two or the arena is exhausted
pub fn alloc(size: usize, align: usize) -> *mut c_void {
    if !align.is_power_of_two() {
        return ptr::null_mut();
    }
    let align = align.max(MIN_ALIGN);
    let base = base();

    let mut cursor = CURSOR.load(Ordering::Relaxed);
    loop {
        // Room for the size word below the block
        let Some(first) = (base + cursor).checked_add(mem::size_of::<usize>() + align - 1) else {
            return ptr::null_mut();
        };
        let block = first & !(align - 1);
        let Some(end) = block.checked_add(size) else {
            return ptr::null_mut();
        };
        if end - base > ARENA_SIZE {
            return ptr::null_mut();
        }
        match CURSOR.compare_exchange_weak(cursor, end - base, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => {
                unsafe { (block as *mut usize).sub(1).write(size) };
                return block as *mut c_void;
            }
            Err(actual) => cursor = actual,
        }
    }
}

pub fn contains(ptr: *const c_void) -> bool {
    let base = base();
    (base..base + ARENA_SIZE).contains(&(ptr as usize))
}

/// Requested size of a block returned by [`alloc`]
///
/// # Safety
///
/// `ptr` must have been returned by [`alloc`].
pub unsafe fn block_size(ptr: *const c_void) -> usize {
    unsafe { (ptr as *const usize).sub(1).read() }
}
