//! Sampling decisions, made on every intercepted allocation.

use crate::error::Error;
use std::cell::Cell;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// How a positive sampling rate selects allocations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplingPolicy {
    /// One in every `rate` allocations, regardless of size
    Uniform,
    /// Roughly one sample per `rate` bytes: allocations larger than `rate`
    /// are always taken, smaller ones in proportion to their size
    #[default]
    SizeWeighted,
}

impl SamplingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplingPolicy::Uniform => "uniform",
            SamplingPolicy::SizeWeighted => "size-weighted",
        }
    }
}

impl fmt::Display for SamplingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SamplingPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uniform" | "count" => Ok(SamplingPolicy::Uniform),
            "size-weighted" | "size_weighted" | "bytes" => Ok(SamplingPolicy::SizeWeighted),
            other => Err(Error::UnknownPolicy(other.to_string())),
        }
    }
}

/// Capture decision state. The uniform policy shares one call counter per
/// sampler; the size-weighted policy only touches thread-local state.
#[derive(Debug)]
pub struct Sampler {
    policy: SamplingPolicy,
    calls: AtomicU64,
}

impl Sampler {
    pub const fn new(policy: SamplingPolicy) -> Self {
        Sampler {
            policy,
            calls: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> SamplingPolicy {
        self.policy
    }

    /// Decide whether an allocation of `size` bytes is captured at `rate`
    #[inline]
    pub fn decide(&self, rate: i64, size: usize) -> bool {
        match self.policy {
            SamplingPolicy::Uniform => {
                if rate <= 0 {
                    return false;
                }
                let index = self.calls.fetch_add(1, Ordering::Relaxed);
                uniform_capture(index, rate)
            }
            SamplingPolicy::SizeWeighted => size_weighted_capture(rate, size, next_random),
        }
    }
}

/// The uniform law: the `call_index`-th allocation is taken iff it is a
/// multiple of `rate`.
#[inline]
pub fn uniform_capture(call_index: u64, rate: i64) -> bool {
    rate > 0 && call_index % rate as u64 == 0
}

/// The size-weighted law. `draw` is only called when the outcome is not
/// already decided by the rate or the size.
#[inline]
pub fn size_weighted_capture(rate: i64, size: usize, draw: impl FnOnce() -> u64) -> bool {
    if rate <= 0 {
        return false;
    }
    let rate = rate as u64;
    let size = size as u64;
    if rate == 1 || size > rate {
        return true;
    }
    draw() % rate <= size
}

thread_local! {
    // 0 = not yet seeded
    static RNG_STATE: Cell<u64> = const { Cell::new(0) };
}

static SEED_SALT: AtomicU64 = AtomicU64::new(0);

#[inline]
fn xorshift64(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn fresh_seed(local: u64) -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let salt = SEED_SALT.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
    match splitmix64(local ^ nanos ^ salt) {
        0 => 0x2545_F491_4F6C_DD1D,
        seed => seed,
    }
}

/// Next value of this thread's xorshift64 generator
fn next_random() -> u64 {
    RNG_STATE
        .try_with(|state| {
            let mut x = state.get();
            if x == 0 {
                x = fresh_seed(state as *const Cell<u64> as u64);
            }
            x = xorshift64(x);
            state.set(x);
            x
        })
        // Thread-local storage already torn down on this thread
        .unwrap_or_else(|_| xorshift64(fresh_seed(0)))
}
