//! Aggregation of raw samples into a heap profile.

mod session;

pub use session::{Session, SessionConfig};

use chrono::{DateTime, Utc};
use cmemprof_trace::SamplingPolicy;
use std::collections::HashMap;
use std::time::Duration;

/// Estimated allocations from one unique call stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackRecord {
    /// Return addresses, most recent first
    pub stack: Vec<u64>,
    /// Estimated number of allocations
    pub count: u64,
    /// Estimated bytes allocated
    pub bytes: u64,
    /// Samples actually observed
    pub samples: u64,
}

/// Samples bucketed by call stack, scaled to estimate true allocation
#[derive(Debug, Clone)]
pub struct HeapProfile {
    policy: SamplingPolicy,
    rate: i64,
    records: Vec<StackRecord>,
    /// stack hash -> indices into `records`
    buckets: HashMap<u64, Vec<usize>>,
    sample_count: u64,
    overwritten: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub duration: Duration,
}

impl HeapProfile {
    /// `rate` is the sampling rate the samples were taken at
    pub fn new(policy: SamplingPolicy, rate: i64) -> Self {
        HeapProfile {
            policy,
            rate,
            records: Vec::new(),
            buckets: HashMap::new(),
            sample_count: 0,
            overwritten: 0,
            started_at: None,
            duration: Duration::ZERO,
        }
    }

    pub fn policy(&self) -> SamplingPolicy {
        self.policy
    }

    pub fn sampling_rate(&self) -> i64 {
        self.rate
    }

    pub fn add_sample(&mut self, stack: &[u64], size: usize) {
        let (count, bytes) = scale(self.policy, self.rate, size as u64);
        self.sample_count += 1;

        let hash = stack_hash(stack);
        let bucket = self.buckets.entry(hash).or_default();
        // Equal hashes are compared in full
        if let Some(&idx) = bucket.iter().find(|&&idx| self.records[idx].stack == stack) {
            let record = &mut self.records[idx];
            record.count = record.count.saturating_add(count);
            record.bytes = record.bytes.saturating_add(bytes);
            record.samples += 1;
            return;
        }

        bucket.push(self.records.len());
        self.records.push(StackRecord {
            stack: stack.to_vec(),
            count,
            bytes,
            samples: 1,
        });
    }

    pub fn records(&self) -> &[StackRecord] {
        &self.records
    }

    /// Records sorted by estimated bytes, largest first
    pub fn top_by_bytes(&self, limit: usize) -> Vec<&StackRecord> {
        let mut sorted: Vec<&StackRecord> = self.records.iter().collect();
        sorted.sort_by(|a, b| b.bytes.cmp(&a.bytes).then(b.count.cmp(&a.count)));
        sorted.truncate(limit);
        sorted
    }

    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.bytes).fold(0, u64::saturating_add)
    }

    pub fn total_count(&self) -> u64 {
        self.records.iter().map(|r| r.count).fold(0, u64::saturating_add)
    }

    /// Raw samples observed
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Samples lost to buffer overrun before the consumer read them
    pub fn overwritten(&self) -> u64 {
        self.overwritten
    }

    pub fn set_overwritten(&mut self, overwritten: u64) {
        self.overwritten = overwritten;
    }
}

/// Weight of one sample of `size` bytes: estimated (allocations, bytes)
/// it stands for.
///
/// Size-weighted sampling catches an allocation smaller than the rate with
/// probability of about `size / rate`, so each such sample stands for
/// `rate / size` allocations totalling `rate` bytes. Uniform sampling keeps
/// one allocation in `rate` whatever its size.
pub fn scale(policy: SamplingPolicy, rate: i64, size: u64) -> (u64, u64) {
    let rate = rate.max(1) as u64;
    match policy {
        SamplingPolicy::SizeWeighted if size >= rate => (1, size),
        // Zero-byte requests carry no byte weight
        SamplingPolicy::SizeWeighted if size == 0 => (rate, 0),
        SamplingPolicy::SizeWeighted => (rate / size, rate),
        SamplingPolicy::Uniform => (rate, size.saturating_mul(rate)),
    }
}

/// One-at-a-time hash over the stack's addresses
pub fn stack_hash(stack: &[u64]) -> u64 {
    let mut h: u64 = 0;
    for &pc in stack {
        h = h.wrapping_add(pc);
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
    }
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h
}
