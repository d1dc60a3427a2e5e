use crate::error::{Error, Result};
use crate::export;
use crate::process::ProcessInfo;
use crate::profile::{Session, SessionConfig};
use crate::storage::Storage;
use crate::symbols::SymbolResolver;
use crate::workload::Workload;
use cmemprof_trace::{CaptureStrategy, Config, SamplingPolicy};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RecordOptions {
    pub output: Option<PathBuf>,
    /// `None` records until `running` is cleared
    pub duration: Option<Duration>,
    pub session: SessionConfig,
    pub policy: SamplingPolicy,
    pub unwinder: CaptureStrategy,
    pub threads: usize,
    pub slots: usize,
    /// Also export the profile here in pprof format
    pub pprof: Option<PathBuf>,
}

/// What a finished recording produced
#[derive(Debug, Clone)]
pub struct RecordSummary {
    pub path: PathBuf,
    pub samples: u64,
    pub callsites: usize,
    pub overwritten: u64,
    pub iterations: u64,
}

/// Default output file: `cmemprof.<process>.<timestamp>.db`
pub fn default_output_path(proc_info: &ProcessInfo) -> PathBuf {
    let timestamp = chrono::Local::now().format("%y%m%d%H%M%S");
    PathBuf::from(format!("cmemprof.{}.{}.db", proc_info.name(), timestamp))
}

/// Stop flag cleared by Ctrl-C
pub fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| Error::Session(format!("failed to set Ctrl-C handler: {e}")))?;
    Ok(running)
}

/// Profile the built-in workload with the process-wide profiler and save
/// the symbolized result.
///
/// Needs the profiling allocator installed in this binary; without it the
/// recording completes with no samples.
pub fn run(opts: &RecordOptions, running: &AtomicBool) -> Result<RecordSummary> {
    let proc_info = ProcessInfo::current()?;
    let output_path = opts
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&proc_info));
    eprintln!("Output: {}", output_path.display());

    // Symbols are loaded before profiling starts
    eprintln!("Loading debug symbols...");
    let mut resolver = SymbolResolver::for_process(&proc_info)?;
    eprintln!(
        "Loaded {} address ranges and {} functions",
        resolver.range_count(),
        resolver.function_count()
    );

    let config = Config::default()
        .with_policy(opts.policy)
        .with_capture(opts.unwinder)
        .with_buffer_slots(opts.slots);
    let profiler = cmemprof_trace::init(config)?;

    let session = Session::start(profiler, opts.session)?;
    let workload = Workload::spawn(opts.threads)?;

    eprintln!(
        "Recording {} workload threads, rate {} ({}, {}){}",
        opts.threads,
        opts.session.sampling_rate,
        opts.policy,
        opts.unwinder,
        if opts.duration.is_some() { "" } else { " (Ctrl-C to stop)" }
    );

    let start = Instant::now();
    while running.load(Ordering::SeqCst) {
        if let Some(max_duration) = opts.duration
            && start.elapsed() >= max_duration
        {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
        eprint!(
            "\rSamples: {} | Iterations: {} | Elapsed: {:.1}s",
            profiler.stats().inserted,
            workload.iterations(),
            start.elapsed().as_secs_f64()
        );
    }
    eprintln!();

    let iterations = workload.stop();
    let profile = session.stop()?;

    let mut storage = Storage::create(&output_path, &proc_info, &profile)?;
    let callsites = storage.write_profile(&profile, &mut resolver)?;

    if let Some(pprof_path) = &opts.pprof {
        let modules = export::loaded_modules(proc_info.exe_path());
        export::write_pprof(pprof_path, &profile, &mut resolver, &modules)?;
        eprintln!("pprof profile: {}", pprof_path.display());
    }

    eprintln!(
        "Recording complete. Samples: {}, callsites: {}",
        profile.sample_count(),
        callsites
    );
    if profile.overwritten() > 0 {
        eprintln!(
            "Warning: {} samples were overwritten before they could be read",
            profile.overwritten()
        );
    }

    Ok(RecordSummary {
        path: output_path,
        samples: profile.sample_count(),
        callsites,
        overwritten: profile.overwritten(),
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output_path() {
        let proc_info = ProcessInfo::current().unwrap();
        let path = default_output_path(&proc_info);
        let name = path.to_string_lossy();
        assert!(name.starts_with(&format!("cmemprof.{}.", proc_info.name())));
        assert!(name.ends_with(".db"));
    }
}
