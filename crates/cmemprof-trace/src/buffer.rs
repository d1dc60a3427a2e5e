//! Fixed-capacity ring of allocation samples.
//!
//! Many producers insert, one consumer drains. A slot whose `ready` flag is
//! clear belongs to the writer side; a set flag hands it to the reader side.
//! One mutex guards every field and one condition variable carries both
//! "a sample is ready" and "the buffer stopped".
//!
//! Nothing here allocates once the ring exists, so `insert` is safe to call
//! from inside an allocator hook.

use crate::config::MAX_STACK_DEPTH;
use crate::error::{Error, Result};
use std::num::NonZeroUsize;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Started,
}

#[derive(Clone, Copy)]
struct Slot {
    stack: [usize; MAX_STACK_DEPTH],
    depth: usize,
    size: usize,
    ready: bool,
}

const EMPTY_SLOT: Slot = Slot {
    stack: [0; MAX_STACK_DEPTH],
    depth: 0,
    size: 0,
    ready: false,
};

struct Ring {
    state: State,
    slots: Box<[Slot]>,
    writer: usize,
    reader: usize,
    inserted: u64,
    overwritten: u64,
}

/// Outcome of a blocking read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retrieved {
    /// `depth` addresses were copied into the caller's buffer
    Sample { depth: usize, size: usize },
    /// The buffer is stopped and nothing is left to read
    Canceled,
}

/// An owned sample, as handed to consumers that don't manage their own
/// stack buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Return addresses, most recent call first
    pub stack: Vec<usize>,
    /// Requested allocation size in bytes
    pub size: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Samples accepted while started
    pub inserted: u64,
    /// Unread samples lost because the ring wrapped
    pub overwritten: u64,
}

pub struct SampleBuffer {
    ring: Mutex<Ring>,
    cond: Condvar,
    capacity: usize,
}

impl SampleBuffer {
    /// Create a stopped buffer with `slots` slots
    pub fn new(slots: usize) -> Result<Self> {
        NonZeroUsize::new(slots)
            .map(Self::with_capacity)
            .ok_or(Error::InvalidCapacity(slots))
    }

    pub fn with_capacity(slots: NonZeroUsize) -> Self {
        let slots = slots.get();
        SampleBuffer {
            ring: Mutex::new(Ring {
                state: State::Stopped,
                slots: vec![EMPTY_SLOT; slots].into_boxed_slice(),
                writer: 0,
                reader: 0,
                inserted: 0,
                overwritten: 0,
            }),
            cond: Condvar::new(),
            capacity: slots,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // A panic while holding the lock leaves the ring structurally intact, so
    // poisoning is ignored rather than spread to every allocating thread.
    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self) {
        self.lock().state = State::Started;
    }

    /// Stop accepting samples and wake a blocked consumer
    pub fn stop(&self) {
        self.lock().state = State::Stopped;
        self.cond.notify_all();
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    pub fn is_started(&self) -> bool {
        self.state() == State::Started
    }

    /// Record a sample. Returns `false` if the buffer is stopped.
    ///
    /// Stacks deeper than [`MAX_STACK_DEPTH`] are truncated. When the ring is
    /// full the oldest unread sample is overwritten.
    pub fn insert(&self, stack: &[usize], size: usize) -> bool {
        let mut ring = self.lock();
        if ring.state == State::Stopped {
            return false;
        }

        let depth = stack.len().min(MAX_STACK_DEPTH);
        let writer = ring.writer;
        let capacity = ring.slots.len();

        if ring.slots[writer].ready {
            // Full: the writer caught up with the reader. Drop the oldest
            // sample and move the reader past it.
            ring.reader = (writer + 1) % capacity;
            ring.overwritten += 1;
        }

        let slot = &mut ring.slots[writer];
        slot.stack[..depth].copy_from_slice(&stack[..depth]);
        slot.depth = depth;
        slot.size = size;
        slot.ready = true;

        ring.writer = (writer + 1) % capacity;
        ring.inserted += 1;
        drop(ring);

        self.cond.notify_one();
        true
    }

    /// Block until a sample is ready or the buffer is stopped.
    ///
    /// Copies at most `out.len()` addresses. Samples still queued after
    /// [`SampleBuffer::stop`] are returned before `Canceled`.
    pub fn get_sample(&self, out: &mut [usize]) -> Retrieved {
        let mut ring = self.lock();
        loop {
            let reader = ring.reader;
            if ring.slots[reader].ready {
                let capacity = ring.slots.len();
                let slot = &mut ring.slots[reader];
                let depth = slot.depth.min(out.len());
                out[..depth].copy_from_slice(&slot.stack[..depth]);
                let size = slot.size;
                slot.ready = false;
                ring.reader = (reader + 1) % capacity;
                return Retrieved::Sample { depth, size };
            }

            if ring.state == State::Stopped {
                return Retrieved::Canceled;
            }

            ring = self.cond.wait(ring).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Owned form of [`SampleBuffer::get_sample`]; `None` means canceled.
    pub fn next_sample(&self, max_frames: usize) -> Option<Sample> {
        // Allocate before taking the lock
        let mut stack = vec![0usize; max_frames.min(MAX_STACK_DEPTH)];
        match self.get_sample(&mut stack) {
            Retrieved::Sample { depth, size } => {
                stack.truncate(depth);
                Some(Sample { stack, size })
            }
            Retrieved::Canceled => None,
        }
    }

    pub fn stats(&self) -> BufferStats {
        let ring = self.lock();
        BufferStats {
            inserted: ring.inserted,
            overwritten: ring.overwritten,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::Duration;

    fn started(slots: usize) -> SampleBuffer {
        let buffer = SampleBuffer::new(slots).unwrap();
        buffer.start();
        buffer
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            SampleBuffer::new(0),
            Err(Error::InvalidCapacity(0))
        ));
    }

    #[test]
    fn test_round_trip() {
        let buffer = started(8);
        let stack = [0x1000, 0x2000, 0x3000];
        assert!(buffer.insert(&stack, 4096));

        let mut out = [0usize; MAX_STACK_DEPTH];
        assert_eq!(
            buffer.get_sample(&mut out),
            Retrieved::Sample {
                depth: 3,
                size: 4096
            }
        );
        assert_eq!(&out[..3], &stack);
    }

    #[test]
    fn test_insert_while_stopped_is_dropped() {
        let buffer = SampleBuffer::new(4).unwrap();
        assert!(!buffer.insert(&[1, 2], 10));
        assert_eq!(buffer.stats().inserted, 0);

        let mut out = [0usize; 4];
        assert_eq!(buffer.get_sample(&mut out), Retrieved::Canceled);
    }

    #[test]
    fn test_deep_stack_truncated() {
        let buffer = started(2);
        let deep: Vec<usize> = (1..=MAX_STACK_DEPTH + 20).collect();
        buffer.insert(&deep, 1);

        let sample = buffer.next_sample(usize::MAX).unwrap();
        assert_eq!(sample.stack.len(), MAX_STACK_DEPTH);
        assert_eq!(sample.stack, deep[..MAX_STACK_DEPTH]);
    }

    #[test]
    fn test_read_honors_max_frames() {
        let buffer = started(2);
        buffer.insert(&[9, 8, 7, 6, 5], 77);

        let mut out = [0usize; 2];
        assert_eq!(
            buffer.get_sample(&mut out),
            Retrieved::Sample { depth: 2, size: 77 }
        );
        assert_eq!(out, [9, 8]);
    }

    #[test]
    fn test_overrun_evicts_oldest() {
        let capacity = 4;
        let buffer = started(capacity);
        for i in 1..=capacity + 1 {
            buffer.insert(&[i], i * 100);
        }
        buffer.stop();

        let mut seen = Vec::new();
        while let Some(sample) = buffer.next_sample(MAX_STACK_DEPTH) {
            seen.push(sample.stack[0]);
        }
        assert_eq!(seen, vec![2, 3, 4, 5]);
        assert_eq!(buffer.stats().overwritten, 1);
        assert_eq!(buffer.stats().inserted, 5);
    }

    #[test]
    fn test_overrun_single_slot() {
        let buffer = started(1);
        buffer.insert(&[1], 1);
        buffer.insert(&[2], 2);
        buffer.insert(&[3], 3);
        buffer.stop();

        assert_eq!(
            buffer.next_sample(4),
            Some(Sample {
                stack: vec![3],
                size: 3
            })
        );
        assert_eq!(buffer.next_sample(4), None);
    }

    #[test]
    fn test_wraps_after_reads() {
        let buffer = started(3);
        for round in 0..10usize {
            buffer.insert(&[round], round);
            let sample = buffer.next_sample(1).unwrap();
            assert_eq!(sample.stack, vec![round]);
            assert_eq!(sample.size, round);
        }
        assert_eq!(buffer.stats().overwritten, 0);
    }

    #[test]
    fn test_stop_drains_then_cancels() {
        let buffer = started(4);
        buffer.insert(&[1], 1);
        buffer.insert(&[2], 2);
        buffer.stop();

        assert_eq!(buffer.next_sample(1).map(|s| s.size), Some(1));
        assert_eq!(buffer.next_sample(1).map(|s| s.size), Some(2));
        assert_eq!(buffer.next_sample(1), None);
    }

    #[test]
    fn test_stop_wakes_blocked_consumer() {
        let buffer = Arc::new(started(4));
        let (tx, rx) = mpsc::channel();

        let consumer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                let mut out = [0usize; 8];
                tx.send(buffer.get_sample(&mut out)).unwrap();
            })
        };

        // Still blocked: nothing inserted, not stopped
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        buffer.stop();
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, Retrieved::Canceled);
        consumer.join().unwrap();
    }

    #[test]
    fn test_blocked_consumer_receives_insert() {
        let buffer = Arc::new(started(4));
        let consumer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || buffer.next_sample(4))
        };

        std::thread::sleep(Duration::from_millis(20));
        buffer.insert(&[0xdead, 0xbeef], 64);

        let sample = consumer.join().unwrap().unwrap();
        assert_eq!(sample.stack, vec![0xdead, 0xbeef]);
        assert_eq!(sample.size, 64);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let buffer = SampleBuffer::new(2).unwrap();
        buffer.start();
        buffer.start();
        assert!(buffer.is_started());
        buffer.stop();
        buffer.stop();
        assert_eq!(buffer.state(), State::Stopped);

        buffer.start();
        assert!(buffer.insert(&[1], 1));
    }
}
