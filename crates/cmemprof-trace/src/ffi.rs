//! C ABI over the process-wide profiler.
//!
//! See `include/cmemprof.h`. A host runtime drives the profiler through
//! these functions and drains samples from a thread of its own.

use crate::Retrieved;
use crate::guard;
use libc::{c_int, size_t};

/// Start accepting samples, creating the profiler on first use
#[unsafe(no_mangle)]
pub extern "C" fn cmemprof_start() {
    crate::start();
}

/// Stop, zero the sampling rate and wake a blocked `cmemprof_get_sample`
#[unsafe(no_mangle)]
pub extern "C" fn cmemprof_stop() {
    crate::stop();
}

/// Returns the previous rate; `rate <= 0` only queries
#[unsafe(no_mangle)]
pub extern "C" fn cmemprof_set_sampling_rate(rate: c_int) -> c_int {
    let previous = crate::set_sampling_rate(i64::from(rate));
    c_int::try_from(previous).unwrap_or(c_int::MAX)
}

/// Block for the next sample. Writes at most `max` addresses to `stack`
/// and the allocation size to `size`, and returns the number of addresses
/// written. 0 means the profiler was stopped and nothing is left, or that
/// `stack` is null or `max <= 0`, in which case nothing is taken.
///
/// # Safety
///
/// `stack` must be null or valid for `max` writes; `size` must be null or
/// valid for one write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cmemprof_get_sample(
    stack: *mut usize,
    max: c_int,
    size: *mut size_t,
) -> c_int {
    let max = match usize::try_from(max) {
        Ok(max) if max > 0 && !stack.is_null() => max,
        _ => return 0,
    };
    let out = unsafe { std::slice::from_raw_parts_mut(stack, max) };

    match crate::get_sample(out) {
        Retrieved::Sample {
            depth,
            size: bytes,
        } => {
            if !size.is_null() {
                unsafe { *size = bytes };
            }
            c_int::try_from(depth).unwrap_or(c_int::MAX)
        }
        Retrieved::Canceled => 0,
    }
}

/// Entry point for allocation hooks written in C
#[unsafe(no_mangle)]
pub extern "C" fn cmemprof_profile_allocation(size: size_t) {
    crate::profile_allocation(size);
}

/// Skip profiling on the calling thread until the matching resume. Nests.
#[unsafe(no_mangle)]
pub extern "C" fn cmemprof_thread_suspend() {
    guard::suspend_current_thread();
}

#[unsafe(no_mangle)]
pub extern "C" fn cmemprof_thread_resume() {
    guard::resume_current_thread();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CaptureStrategy, Config, SamplingPolicy};
    use std::ptr;

    const SIZE: usize = 4242;
    const SUSPENDED_SIZE: usize = 4343;

    // One test: every C entry point shares the process-wide profiler.
    #[test]
    fn test_c_abi_lifecycle() {
        let config = Config::default()
            .with_policy(SamplingPolicy::Uniform)
            .with_capture(CaptureStrategy::Unwind)
            .with_buffer_slots(4096);
        let _ = crate::init(config);

        cmemprof_start();
        let initial = cmemprof_set_sampling_rate(0);
        assert_eq!(cmemprof_set_sampling_rate(1), initial);
        assert_eq!(cmemprof_set_sampling_rate(-3), 1);

        // A rate beyond c_int reads back clamped
        crate::set_sampling_rate(i64::from(c_int::MAX) + 1);
        assert_eq!(cmemprof_set_sampling_rate(1), c_int::MAX);

        cmemprof_thread_suspend();
        cmemprof_profile_allocation(SUSPENDED_SIZE);
        cmemprof_thread_resume();
        cmemprof_profile_allocation(SIZE);

        // Unusable arguments leave the queued sample in place
        let mut stack = [0usize; 64];
        let mut size: size_t = 0;
        unsafe {
            assert_eq!(cmemprof_get_sample(ptr::null_mut(), 64, &mut size), 0);
            assert_eq!(cmemprof_get_sample(stack.as_mut_ptr(), 0, &mut size), 0);
            assert_eq!(cmemprof_get_sample(stack.as_mut_ptr(), -1, &mut size), 0);
        }
        assert_eq!(size, 0);
        assert!(crate::global_or_init().is_started());

        let mut sizes = Vec::new();
        while !sizes.contains(&SIZE) {
            let depth = unsafe { cmemprof_get_sample(stack.as_mut_ptr(), 64, &mut size) };
            assert!(depth > 0);
            assert!(stack[..depth as usize].iter().all(|&addr| addr != 0));
            sizes.push(size);
        }

        cmemprof_stop();
        assert_eq!(cmemprof_set_sampling_rate(0), 0);
        while unsafe { cmemprof_get_sample(stack.as_mut_ptr(), 64, &mut size) } > 0 {
            sizes.push(size);
        }
        assert!(!sizes.contains(&SUSPENDED_SIZE));
        // Canceled stays canceled
        assert_eq!(unsafe { cmemprof_get_sample(stack.as_mut_ptr(), 64, ptr::null_mut()) }, 0);
    }
}
