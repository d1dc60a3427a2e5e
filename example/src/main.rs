//! Demo application that profiles itself.
//!
//! Build: cargo build --release
//! Run:   ./target/release/example_app [seconds]
//! Then:  cmemprof top

mod cache;
mod pool;

use anyhow::Context;
use cmemprof::commands::record::default_output_path;
use cmemprof::process::ProcessInfo;
use cmemprof::profile::{Session, SessionConfig};
use cmemprof::storage::Storage;
use cmemprof::symbols::SymbolResolver;
use std::time::{Duration, Instant};

cmemprof_trace::profiler!();

fn main() -> anyhow::Result<()> {
    let seconds: u64 = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("duration must be a number of seconds")?,
        None => 5,
    };

    let proc_info = ProcessInfo::current()?;
    let mut resolver = SymbolResolver::for_process(&proc_info)?;

    let profiler = cmemprof_trace::init(cmemprof_trace::Config::from_env()?)?;
    let session = Session::start(profiler, SessionConfig::from_env()?)?;

    println!("Profiling for {seconds}s (PID {})", proc_info.pid());
    let mut cache = cache::DataCache::new(512);
    let mut pool = pool::BufferPool::new();
    let start = Instant::now();
    let mut tick: u64 = 0;

    while start.elapsed() < Duration::from_secs(seconds) {
        tick += 1;
        let key = format!("user:{}", tick % 2048);
        if cache.get(&key).is_none() {
            cache.put(key, vec![0u8; 256 + (tick % 4096) as usize]);
        }
        if tick % 200 == 0 {
            pool.tick();
        }
        std::thread::sleep(Duration::from_micros(200));
    }

    let profile = session.stop()?;
    println!(
        "{} samples, {} stacks, cache holds {} entries",
        profile.sample_count(),
        profile.records().len(),
        cache.len()
    );

    let path = default_output_path(&proc_info);
    let mut storage = Storage::create(&path, &proc_info, &profile)?;
    storage.write_profile(&profile, &mut resolver)?;

    for entry in storage.query_top_heap(10, None)? {
        println!(
            "{:>12}  {:>8} calls  {}:{}  {}",
            entry.alloc_bytes, entry.alloc_count, entry.file, entry.line, entry.function
        );
    }
    println!("Saved {}", path.display());
    Ok(())
}
