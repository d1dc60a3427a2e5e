//! Stack capture strategies.
//!
//! A capturer fills `out` with return addresses of the calling thread,
//! most recent first, and returns how many it wrote. It runs on the
//! allocation path, so it must neither allocate nor block.

use crate::error::Error;
use crate::guard;
use std::fmt;
use std::str::FromStr;

pub trait StackCapturer: Send + Sync {
    /// Capture at most `out.len()` return addresses. Returns the depth.
    fn capture(&self, out: &mut [usize]) -> usize;
}

impl<F> StackCapturer for F
where
    F: Fn(&mut [usize]) -> usize + Send + Sync,
{
    fn capture(&self, out: &mut [usize]) -> usize {
        self(out).min(out.len())
    }
}

/// Which built-in capturer the profiler uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStrategy {
    /// Walk saved frame pointers. Needs `-C force-frame-pointers=yes`
    /// for complete stacks.
    FramePointer,
    /// Ask the platform unwinder (DWARF CFI) through the `backtrace` crate.
    Unwind,
}

impl Default for CaptureStrategy {
    fn default() -> Self {
        if FramePointerCapturer::SUPPORTED {
            CaptureStrategy::FramePointer
        } else {
            CaptureStrategy::Unwind
        }
    }
}

impl CaptureStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureStrategy::FramePointer => "frame-pointer",
            CaptureStrategy::Unwind => "unwind",
        }
    }
}

impl fmt::Display for CaptureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptureStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "frame-pointer" | "frame_pointer" | "fp" => Ok(CaptureStrategy::FramePointer),
            "unwind" | "unwinder" | "backtrace" => Ok(CaptureStrategy::Unwind),
            other => Err(Error::UnknownCapturer(other.to_string())),
        }
    }
}

impl StackCapturer for CaptureStrategy {
    #[inline]
    fn capture(&self, out: &mut [usize]) -> usize {
        match self {
            CaptureStrategy::FramePointer => FramePointerCapturer.capture(out),
            CaptureStrategy::Unwind => UnwindCapturer.capture(out),
        }
    }
}

/// Self-contained frame-pointer walker
#[derive(Debug, Clone, Copy, Default)]
pub struct FramePointerCapturer;

/// Highest user-space address a frame pointer may hold
#[cfg(target_arch = "x86_64")]
const MAX_USER_ADDR: usize = 0x7fff_ffff_ffff;
#[cfg(not(target_arch = "x86_64"))]
const MAX_USER_ADDR: usize = usize::MAX >> 1;

/// A single frame larger than this ends the walk
const MAX_FRAME_SPAN: usize = 8 << 20;

impl FramePointerCapturer {
    pub const SUPPORTED: bool = cfg!(any(target_arch = "x86_64", target_arch = "aarch64"));

    #[inline(always)]
    fn current_frame_pointer() -> *const usize {
        let fp: *const usize;
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::asm!(
                "mov {}, rbp",
                out(reg) fp,
                options(nomem, nostack, preserves_flags)
            );
        }
        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!(
                "mov {}, x29",
                out(reg) fp,
                options(nomem, nostack, preserves_flags)
            );
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            fp = core::ptr::null();
        }
        fp
    }

    /// Walk the frame chain starting at `fp`
    fn walk(mut fp: *const usize, out: &mut [usize]) -> usize {
        let mut depth = 0;

        while !fp.is_null() && depth < out.len() {
            let fp_val = fp as usize;
            if fp_val & (core::mem::align_of::<usize>() - 1) != 0 {
                break;
            }
            if !(0x1000..=MAX_USER_ADDR).contains(&fp_val) {
                break;
            }

            // Saved return address sits right above the saved frame pointer
            let ret_addr = unsafe { *fp.add(1) };
            if ret_addr == 0 {
                break;
            }
            out[depth] = ret_addr;
            depth += 1;

            let next_fp = unsafe { *fp } as *const usize;
            if next_fp <= fp || (next_fp as usize) - fp_val > MAX_FRAME_SPAN {
                break;
            }
            fp = next_fp;
        }

        depth
    }
}

impl StackCapturer for FramePointerCapturer {
    #[inline(never)]
    fn capture(&self, out: &mut [usize]) -> usize {
        if !Self::SUPPORTED {
            return 0;
        }
        Self::walk(Self::current_frame_pointer(), out)
    }
}

/// Capturer backed by the platform unwinder
#[derive(Debug, Clone, Copy, Default)]
pub struct UnwindCapturer;

impl StackCapturer for UnwindCapturer {
    #[inline(never)]
    fn capture(&self, out: &mut [usize]) -> usize {
        if out.is_empty() || !guard::unwind_permitted() {
            return 0;
        }

        let mut depth = 0;
        // The entry point's recursion fence already serializes us per thread;
        // the synchronized variant would take a process-wide lock.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                out[depth] = frame.ip() as usize;
                depth += 1;
                depth < out.len()
            });
        }
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn capture_nested(capturer: &dyn StackCapturer, levels: usize, out: &mut [usize]) -> usize {
        if levels == 0 {
            capturer.capture(out)
        } else {
            let depth = capture_nested(capturer, levels - 1, out);
            std::hint::black_box(depth)
        }
    }

    #[test]
    fn test_walk_synthetic_frames() {
        // Three fake frames laid out as [saved fp, return address] pairs
        let mut frames = [0usize; 6];
        let base = frames.as_mut_ptr();
        unsafe {
            *base.add(0) = base.add(2) as usize;
            *base.add(1) = 0xAAA0;
            *base.add(2) = base.add(4) as usize;
            *base.add(3) = 0xBBB0;
            *base.add(4) = 0;
            *base.add(5) = 0xCCC0;
        }

        let mut out = [0usize; 8];
        let depth = FramePointerCapturer::walk(base as *const usize, &mut out);
        assert_eq!(depth, 3);
        assert_eq!(&out[..3], &[0xAAA0, 0xBBB0, 0xCCC0]);

        let mut short = [0usize; 2];
        assert_eq!(FramePointerCapturer::walk(base as *const usize, &mut short), 2);
        assert_eq!(short, [0xAAA0, 0xBBB0]);
    }

    #[test]
    fn test_walk_rejects_bad_pointers() {
        let mut out = [0usize; 4];
        assert_eq!(FramePointerCapturer::walk(core::ptr::null(), &mut out), 0);
        assert_eq!(FramePointerCapturer::walk(0x10 as *const usize, &mut out), 0);
        assert_eq!(FramePointerCapturer::walk(0x1001 as *const usize, &mut out), 0);
    }

    #[test]
    fn test_unwind_capture_is_bounded() {
        let mut out = [0usize; 4];
        let depth = capture_nested(&UnwindCapturer, 16, &mut out);
        assert!(depth > 0);
        assert!(depth <= out.len());
        assert!(out[..depth].iter().all(|&addr| addr != 0));
    }

    #[test]
    fn test_unwind_refused_during_module_walk() {
        let mut out = [0usize; 16];
        let _walk = guard::ModuleWalkGuard::enter();
        assert_eq!(UnwindCapturer.capture(&mut out), 0);
    }

    #[test]
    fn test_frame_pointer_capture_is_bounded() {
        let mut out = [0usize; 3];
        let depth = capture_nested(&FramePointerCapturer, 8, &mut out);
        assert!(depth <= out.len());
        if !FramePointerCapturer::SUPPORTED {
            assert_eq!(depth, 0);
        }
    }

    #[test]
    fn test_empty_output_buffer() {
        let mut out: [usize; 0] = [];
        assert_eq!(UnwindCapturer.capture(&mut out), 0);
        assert_eq!(FramePointerCapturer.capture(&mut out), 0);
    }

    #[test]
    fn test_closure_capturer_is_clamped() {
        let liar = |out: &mut [usize]| {
            out.fill(7);
            out.len() + 10
        };
        let mut out = [0usize; 5];
        assert_eq!(liar.capture(&mut out), 5);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "fp".parse::<CaptureStrategy>().unwrap(),
            CaptureStrategy::FramePointer
        );
        assert_eq!(
            "Unwind".parse::<CaptureStrategy>().unwrap(),
            CaptureStrategy::Unwind
        );
        assert!("guess".parse::<CaptureStrategy>().is_err());
    }
}
