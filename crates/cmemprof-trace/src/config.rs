//! Profiler configuration.
//!
//! The sampling rate itself is not part of [`Config`]: it is live state on
//! the profiler (see [`crate::Profiler::set_sampling_rate`]) and starts at 0.

use crate::capture::CaptureStrategy;
use crate::error::{Error, Result};
use crate::sampler::SamplingPolicy;

/// Maximum number of return addresses kept per sample
pub const MAX_STACK_DEPTH: usize = 64;

/// Default number of slots in the sample ring
pub const DEFAULT_BUFFER_SLOTS: usize = 1024;

/// Default sampling rate: on average one sample per MiB allocated
pub const DEFAULT_SAMPLING_RATE: i64 = 1024 * 1024;

pub const ENV_POLICY: &str = "CMEMPROF_POLICY";
pub const ENV_UNWINDER: &str = "CMEMPROF_UNWINDER";
pub const ENV_SLOTS: &str = "CMEMPROF_SLOTS";
pub const ENV_RATE: &str = "CMEMPROF_RATE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// How a positive sampling rate is turned into capture decisions
    pub policy: SamplingPolicy,
    /// Which stack capturer the profiler uses
    pub capture: CaptureStrategy,
    /// Number of slots in the sample ring
    pub buffer_slots: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            policy: SamplingPolicy::default(),
            capture: CaptureStrategy::default(),
            buffer_slots: DEFAULT_BUFFER_SLOTS,
        }
    }
}

impl Config {
    pub fn with_policy(mut self, policy: SamplingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_capture(mut self, capture: CaptureStrategy) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_buffer_slots(mut self, slots: usize) -> Self {
        self.buffer_slots = slots;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_slots == 0 {
            return Err(Error::InvalidCapacity(self.buffer_slots));
        }
        Ok(())
    }

    /// Build a config from `CMEMPROF_*` environment variables, falling back
    /// to defaults for unset ones.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Config::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(policy) = lookup(ENV_POLICY) {
            config.policy = policy.parse()?;
        }
        if let Some(capture) = lookup(ENV_UNWINDER) {
            config.capture = capture.parse()?;
        }
        if let Some(slots) = lookup(ENV_SLOTS) {
            config.buffer_slots = slots.trim().parse().map_err(|e| Error::InvalidEnv {
                var: ENV_SLOTS.to_string(),
                message: format!("{e}"),
            })?;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Parse a sampling rate. Accepts a plain integer or a byte count with a
/// binary suffix (`512K`, `1M`, `2G`, optionally followed by `iB`/`B`).
pub fn parse_rate(s: &str) -> Result<i64> {
    let trimmed = s.trim();
    let lower = trimmed.to_ascii_lowercase();
    let digits = lower
        .strip_suffix("ib")
        .or_else(|| lower.strip_suffix('b'))
        .unwrap_or(&lower);

    let (number, multiplier) = match digits.chars().last() {
        Some('k') => (&digits[..digits.len() - 1], 1i64 << 10),
        Some('m') => (&digits[..digits.len() - 1], 1i64 << 20),
        Some('g') => (&digits[..digits.len() - 1], 1i64 << 30),
        _ => (digits, 1),
    };

    let value: i64 = number
        .trim()
        .parse()
        .map_err(|_| Error::InvalidRate(trimmed.to_string()))?;

    let rate = value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::InvalidRate(trimmed.to_string()))?;
    if rate < 0 {
        return Err(Error::InvalidRate(trimmed.to_string()));
    }
    Ok(rate)
}
