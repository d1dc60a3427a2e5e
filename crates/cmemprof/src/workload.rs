//! Built-in allocation workload driven by `cmemprof record`.
//!
//! A few allocation sites with very different size profiles, so a recording
//! has something to attribute: many small strings, medium vectors, rare
//! large buffers and a bounded cache that keeps reallocating.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

/// Counters shared by all workload threads
#[derive(Debug, Default)]
pub struct WorkloadStats {
    pub iterations: AtomicU64,
}

/// Allocating threads that run until stopped
pub struct Workload {
    running: Arc<AtomicBool>,
    stats: Arc<WorkloadStats>,
    threads: Vec<JoinHandle<()>>,
}

impl Workload {
    pub fn spawn(threads: usize) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(WorkloadStats::default());
        let mut handles = Vec::with_capacity(threads);

        for id in 0..threads {
            let running = running.clone();
            let stats = stats.clone();
            let handle = std::thread::Builder::new()
                .name(format!("workload-{id}"))
                .spawn(move || worker(id as u64, &running, &stats))?;
            handles.push(handle);
        }

        Ok(Workload {
            running,
            stats,
            threads: handles,
        })
    }

    pub fn iterations(&self) -> u64 {
        self.stats.iterations.load(Ordering::Relaxed)
    }

    /// Stop all threads and wait for them
    pub fn stop(self) -> u64 {
        self.running.store(false, Ordering::Relaxed);
        for handle in self.threads {
            if handle.join().is_err() {
                tracing::warn!("workload thread panicked");
            }
        }
        self.stats.iterations.load(Ordering::Relaxed)
    }
}

fn worker(seed: u64, running: &AtomicBool, stats: &WorkloadStats) {
    let mut cache = RecordCache::new(256);
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;

    while running.load(Ordering::Relaxed) {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;

        let labels = build_labels(state, 16);
        let batch = build_batch(state, 64 + (state % 512) as usize);
        cache.put(labels.join("/"), batch);

        if state % 64 == 0 {
            let snapshot = large_snapshot(256 * 1024);
            std::hint::black_box(&snapshot);
        }

        std::hint::black_box(&labels);
        stats.iterations.fetch_add(1, Ordering::Relaxed);
    }
}

/// Many small strings
#[inline(never)]
pub fn build_labels(state: u64, count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("label-{}-{}", i, state % 1000))
        .collect()
}

/// Medium vectors
#[inline(never)]
pub fn build_batch(state: u64, len: usize) -> Vec<u64> {
    let mut batch = Vec::new();
    for i in 0..len as u64 {
        batch.push(state.wrapping_add(i));
    }
    batch
}

/// Rare large buffers
#[inline(never)]
pub fn large_snapshot(bytes: usize) -> Vec<u8> {
    vec![0xa5; bytes]
}

/// Bounded map that evicts the oldest insertion
pub struct RecordCache {
    entries: HashMap<String, Vec<u64>>,
    order: Vec<String>,
    capacity: usize,
}

impl RecordCache {
    pub fn new(capacity: usize) -> Self {
        RecordCache {
            entries: HashMap::new(),
            order: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    #[inline(never)]
    pub fn put(&mut self, key: String, value: Vec<u64>) {
        if !self.entries.contains_key(&key)
            && self.entries.len() >= self.capacity
            && !self.order.is_empty()
        {
            let oldest = self.order.remove(0);
            self.entries.remove(&oldest);
        }
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push(key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cache_is_bounded() {
        let mut cache = RecordCache::new(2);
        cache.put("a".to_string(), vec![1]);
        cache.put("b".to_string(), vec![2]);
        cache.put("c".to_string(), vec![3]);
        assert_eq!(cache.len(), 2);
        assert!(!cache.entries.contains_key("a"));

        cache.put("c".to_string(), vec![4]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.order, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_workload_runs_and_stops() {
        let workload = Workload::spawn(2).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let iterations = workload.stop();
        assert!(iterations > 0);
    }

    #[test]
    fn test_allocation_sites() {
        assert_eq!(build_labels(7, 3), vec!["label-0-7", "label-1-7", "label-2-7"]);
        assert_eq!(build_batch(10, 3), vec![10, 11, 12]);
        assert_eq!(large_snapshot(1024).len(), 1024);
    }
}
