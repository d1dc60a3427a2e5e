//! In-process sampling heap profiler.
//!
//! Every intercepted allocation is offered to a [`Profiler`], which decides
//! cheaply whether to sample it, captures the calling stack, and queues the
//! sample in a fixed-size ring for a single consumer to drain.
//!
//! # Usage
//!
//! Add to your `Cargo.toml`:
//! ```toml
//! [dependencies]
//! cmemprof-trace = { version = "0.1", features = ["profiling"] }
//! ```
//!
//! Install the allocator hook and drive the profiler:
//! ```rust,ignore
//! cmemprof_trace::profiler!();
//!
//! fn main() {
//!     cmemprof_trace::start();
//!     cmemprof_trace::set_sampling_rate(512 * 1024);
//!
//!     std::thread::spawn(|| {
//!         let _quiet = cmemprof_trace::suspend();
//!         while let Some(sample) = cmemprof_trace::next_sample(64) {
//!             // aggregate sample.stack / sample.size
//!         }
//!     });
//!
//!     // ... workload ...
//!     cmemprof_trace::stop();
//! }
//! ```
//!
//! Build with frame pointers for complete stacks from the default capturer:
//! ```bash
//! RUSTFLAGS="-C force-frame-pointers=yes" cargo build --release --features profiling
//! ```
//!
//! C and C++ allocations are hooked with the `interpose` feature (preload)
//! or the `wrap` feature (`-Wl,--wrap=malloc`), and driven through the C ABI
//! of the `ffi` feature.

pub mod buffer;
pub mod capture;
pub mod config;
pub mod error;
#[cfg(feature = "ffi")]
pub mod ffi;
pub mod guard;
pub mod hooks;
pub mod profiler;
pub mod sampler;

pub use buffer::{BufferStats, Retrieved, Sample, SampleBuffer};
pub use capture::{CaptureStrategy, FramePointerCapturer, StackCapturer, UnwindCapturer};
pub use config::{Config, DEFAULT_BUFFER_SLOTS, DEFAULT_SAMPLING_RATE, MAX_STACK_DEPTH, parse_rate};
pub use error::{Error, Result};
pub use guard::{SuspendGuard, suspend};
pub use hooks::ProfilingAllocator;
pub use profiler::Profiler;
pub use sampler::{Sampler, SamplingPolicy};

use std::sync::OnceLock;

static PROFILER: OnceLock<Profiler> = OnceLock::new();

/// Install the process-wide profiler.
///
/// Fails with [`Error::AlreadyInitialized`] if one is already installed,
/// including one created implicitly by [`global_or_init`].
pub fn init(config: Config) -> Result<&'static Profiler> {
    let profiler = Profiler::new(config)?;
    let mut installed = false;
    let global = PROFILER.get_or_init(|| {
        installed = true;
        profiler
    });

    if !installed {
        return Err(Error::AlreadyInitialized);
    }
    tracing::info!(
        policy = %config.policy,
        capture = %config.capture,
        slots = config.buffer_slots,
        "heap profiler initialized"
    );
    Ok(global)
}

/// The process-wide profiler, if installed. Allocation hooks only ever use
/// this, so an allocation made while the profiler is being built is simply
/// not profiled.
#[inline]
pub fn global() -> Option<&'static Profiler> {
    PROFILER.get()
}

/// The process-wide profiler, built from `CMEMPROF_*` environment variables
/// if nothing is installed yet. Invalid variables are logged and ignored.
pub fn global_or_init() -> &'static Profiler {
    PROFILER.get_or_init(|| {
        let config = Config::from_env().unwrap_or_else(|err| {
            tracing::warn!(%err, "ignoring profiler environment, using defaults");
            Config::default()
        });
        tracing::info!(
            policy = %config.policy,
            capture = %config.capture,
            slots = config.buffer_slots,
            "heap profiler initialized"
        );
        Profiler::new_lenient(config)
    })
}

/// Start accepting samples
pub fn start() {
    global_or_init().start();
}

/// Stop accepting samples, zero the rate and wake the consumer
pub fn stop() {
    if let Some(profiler) = global() {
        profiler.stop();
    }
}

/// Set the sampling rate, returning the previous one. `rate <= 0` only
/// queries.
pub fn set_sampling_rate(rate: i64) -> i64 {
    global_or_init().set_sampling_rate(rate)
}

/// Block for the next sample. See [`SampleBuffer::get_sample`].
pub fn get_sample(out: &mut [usize]) -> Retrieved {
    global_or_init().get_sample(out)
}

/// Block for the next sample, owned. `None` once stopped and drained.
pub fn next_sample(max_frames: usize) -> Option<Sample> {
    global_or_init().next_sample(max_frames)
}

/// Report an allocation of `size` bytes from a custom hook
#[inline]
pub fn profile_allocation(size: usize) {
    hooks::observe(size);
}

/// Report `calloc(nmemb, size)`. Overflowing requests are not sampled.
#[inline]
pub fn profile_calloc(nmemb: usize, size: usize) {
    hooks::observe_calloc(nmemb, size);
}

/// Install [`ProfilingAllocator`] as the global allocator.
///
/// With the `heap` feature disabled this expands to nothing, and the
/// program keeps its default allocator.
///
/// ```rust,ignore
/// cmemprof_trace::profiler!();
/// ```
#[macro_export]
#[cfg(feature = "heap")]
macro_rules! profiler {
    () => {
        #[global_allocator]
        static __CMEMPROF_ALLOC: $crate::ProfilingAllocator = $crate::ProfilingAllocator::new();
    };
}

/// No-op when the heap feature is disabled
#[macro_export]
#[cfg(not(feature = "heap"))]
macro_rules! profiler {
    () => {};
}
