use cmemprof_trace::{Config, MAX_STACK_DEPTH, Profiler, Retrieved, SamplingPolicy};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

type TestCapturer = fn(&mut [usize]) -> usize;

fn two_frames(out: &mut [usize]) -> usize {
    out[0] = 0x1111;
    out[1] = 0x2222;
    2
}

fn every_allocation(slots: usize) -> Arc<Profiler<TestCapturer>> {
    let config = Config::default()
        .with_policy(SamplingPolicy::Uniform)
        .with_buffer_slots(slots);
    let profiler = Profiler::with_capturer(config, two_frames as TestCapturer).unwrap();
    profiler.start();
    profiler.set_sampling_rate(1);
    Arc::new(profiler)
}

#[test]
fn test_many_producers_one_consumer() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 5_000;

    let profiler = every_allocation(64);

    let consumer = {
        let profiler = Arc::clone(&profiler);
        thread::spawn(move || {
            let mut received = Vec::new();
            while let Some(sample) = profiler.next_sample(MAX_STACK_DEPTH) {
                received.push(sample);
            }
            received
        })
    };

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|id| {
            let profiler = Arc::clone(&profiler);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    // Encode producer and sequence number in the size
                    profiler.profile_allocation(id * 1_000_000 + i);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    profiler.stop();
    let received = consumer.join().unwrap();
    let stats = profiler.stats();

    assert_eq!(stats.inserted, (PRODUCERS * PER_PRODUCER) as u64);
    assert_eq!(received.len() as u64, stats.inserted - stats.overwritten);

    // Intact samples, each producer's samples in the order produced
    let mut last_seen: HashMap<usize, usize> = HashMap::new();
    for sample in &received {
        assert_eq!(sample.stack, vec![0x1111, 0x2222]);
        let (id, seq) = (sample.size / 1_000_000, sample.size % 1_000_000);
        assert!(id < PRODUCERS);
        if let Some(&prev) = last_seen.get(&id) {
            assert!(seq > prev, "producer {id}: {seq} after {prev}");
        }
        last_seen.insert(id, seq);
    }
}

#[test]
fn test_stop_unblocks_waiting_consumer() {
    let profiler = every_allocation(16);
    let (tx, rx) = mpsc::channel();

    let consumer = {
        let profiler = Arc::clone(&profiler);
        thread::spawn(move || {
            let mut out = [0usize; MAX_STACK_DEPTH];
            let _ = tx.send(profiler.get_sample(&mut out));
        })
    };

    thread::sleep(Duration::from_millis(50));
    profiler.stop();

    let outcome = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("consumer still blocked after stop");
    assert_eq!(outcome, Retrieved::Canceled);
    consumer.join().unwrap();
}

#[test]
fn test_rate_change_while_running() {
    let profiler = every_allocation(1024);

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let profiler = Arc::clone(&profiler);
            thread::spawn(move || {
                for size in 0..2_000 {
                    profiler.profile_allocation(size);
                }
            })
        })
        .collect();

    // Flip the rate under the producers' feet; nothing may deadlock
    for rate in [7, 3, 1, 50] {
        profiler.set_sampling_rate(rate);
        thread::yield_now();
    }
    for producer in producers {
        producer.join().unwrap();
    }

    profiler.stop();
    let mut drained = 0u64;
    while profiler.next_sample(4).is_some() {
        drained += 1;
    }
    let stats = profiler.stats();
    assert!(stats.inserted > 0);
    assert_eq!(drained, stats.inserted - stats.overwritten);
}
