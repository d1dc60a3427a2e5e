//! The profiler service object: sampling rate, sampler, capturer and sample
//! buffer behind one handle.

use crate::buffer::{BufferStats, Retrieved, Sample, SampleBuffer};
use crate::capture::{CaptureStrategy, StackCapturer};
use crate::config::{Config, DEFAULT_BUFFER_SLOTS, MAX_STACK_DEPTH};
use crate::error::Result;
use crate::guard::{self, ProfilerEntry};
use crate::sampler::{Sampler, SamplingPolicy};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

const DEFAULT_SLOTS: NonZeroUsize = match NonZeroUsize::new(DEFAULT_BUFFER_SLOTS) {
    Some(slots) => slots,
    None => NonZeroUsize::MIN,
};

/// A sampling heap profiler.
///
/// Starts stopped with a sampling rate of 0. Every method takes `&self`, so
/// one instance is shared by all allocating threads and a single consumer.
pub struct Profiler<C = CaptureStrategy> {
    rate: AtomicI64,
    sampler: Sampler,
    capturer: C,
    buffer: SampleBuffer,
    consumer_claimed: AtomicBool,
}

impl Profiler<CaptureStrategy> {
    /// Build a profiler using the capturer named in `config`
    pub fn new(config: Config) -> Result<Self> {
        Self::with_capturer(config, config.capture)
    }

    /// Build from a config that may be invalid, substituting defaults for
    /// anything unusable. Used where there is no caller to report to.
    pub(crate) fn new_lenient(config: Config) -> Self {
        let slots = NonZeroUsize::new(config.buffer_slots).unwrap_or(DEFAULT_SLOTS);
        Profiler {
            rate: AtomicI64::new(0),
            sampler: Sampler::new(config.policy),
            capturer: config.capture,
            buffer: SampleBuffer::with_capacity(slots),
            consumer_claimed: AtomicBool::new(false),
        }
    }
}

impl<C: StackCapturer> Profiler<C> {
    /// Build a profiler around a custom capturer. `config.capture` is ignored.
    pub fn with_capturer(config: Config, capturer: C) -> Result<Self> {
        config.validate()?;
        Ok(Profiler {
            rate: AtomicI64::new(0),
            sampler: Sampler::new(config.policy),
            capturer,
            buffer: SampleBuffer::new(config.buffer_slots)?,
            consumer_claimed: AtomicBool::new(false),
        })
    }

    pub fn policy(&self) -> SamplingPolicy {
        self.sampler.policy()
    }

    pub fn capturer(&self) -> &C {
        &self.capturer
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Accept samples. Does not touch the sampling rate.
    pub fn start(&self) {
        self.buffer.start();
        tracing::debug!(
            policy = %self.policy(),
            slots = self.buffer.capacity(),
            "heap profiler started"
        );
    }

    /// Stop accepting samples, set the rate to 0 and wake the consumer
    pub fn stop(&self) {
        self.rate.store(0, Ordering::Relaxed);
        self.buffer.stop();
        tracing::debug!("heap profiler stopped");
    }

    pub fn is_started(&self) -> bool {
        self.buffer.is_started()
    }

    /// Set the sampling rate and return the previous one. A `rate <= 0`
    /// leaves the current rate in place, which makes this a query.
    pub fn set_sampling_rate(&self, rate: i64) -> i64 {
        if rate > 0 {
            let previous = self.rate.swap(rate, Ordering::Relaxed);
            tracing::debug!(rate, previous, "sampling rate changed");
            previous
        } else {
            self.rate.load(Ordering::Relaxed)
        }
    }

    pub fn sampling_rate(&self) -> i64 {
        self.rate.load(Ordering::Relaxed)
    }

    /// Called on every intercepted allocation of `size` bytes.
    ///
    /// Never fails and never blocks beyond the buffer's short critical
    /// section. The cheap exits come first: a suspended thread, then a zero
    /// rate.
    #[inline]
    pub fn profile_allocation(&self, size: usize) {
        if guard::profiling_suspended() {
            return;
        }
        let rate = self.rate.load(Ordering::Relaxed);
        if rate == 0 {
            return;
        }
        if !self.sampler.decide(rate, size) {
            return;
        }
        self.record(size);
    }

    /// `calloc(nmemb, size)`: an overflowing request is never sampled
    #[inline]
    pub fn profile_calloc(&self, nmemb: usize, size: usize) {
        if let Some(total) = nmemb.checked_mul(size) {
            self.profile_allocation(total);
        }
    }

    #[inline(never)]
    fn record(&self, size: usize) {
        let Some(_entry) = ProfilerEntry::enter() else {
            return;
        };

        let mut stack = [0usize; MAX_STACK_DEPTH];
        let depth = self.capturer.capture(&mut stack).min(MAX_STACK_DEPTH);
        // An empty stack is indistinguishable from a canceled read on the
        // C side, so it is not worth keeping.
        if depth == 0 {
            return;
        }
        self.buffer.insert(&stack[..depth], size);
    }

    /// Block for the next sample; see [`SampleBuffer::get_sample`]
    pub fn get_sample(&self, out: &mut [usize]) -> Retrieved {
        self.buffer.get_sample(out)
    }

    /// Block for the next sample, owned. `None` once stopped and drained.
    pub fn next_sample(&self, max_frames: usize) -> Option<Sample> {
        self.buffer.next_sample(max_frames)
    }

    pub fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    /// Register as the single consumer. Returns `false` if another
    /// consumer holds the claim.
    pub fn try_claim_consumer(&self) -> bool {
        !self.consumer_claimed.swap(true, Ordering::AcqRel)
    }

    pub fn release_consumer(&self) {
        self.consumer_claimed.store(false, Ordering::Release);
    }
}

impl Default for Profiler<CaptureStrategy> {
    fn default() -> Self {
        Self::new_lenient(Config::default())
    }
}
