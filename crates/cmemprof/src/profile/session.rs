use super::HeapProfile;
use crate::error::{Error, Result};
use cmemprof_trace::config::ENV_RATE;
use cmemprof_trace::{DEFAULT_SAMPLING_RATE, MAX_STACK_DEPTH, Profiler, StackCapturer, parse_rate};
use std::thread::JoinHandle;
use std::time::Instant;

/// Consumer-side settings for one profiling session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub sampling_rate: i64,
    /// Frames kept per sample, at most `MAX_STACK_DEPTH`
    pub max_frames: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            sampling_rate: DEFAULT_SAMPLING_RATE,
            max_frames: MAX_STACK_DEPTH,
        }
    }
}

impl SessionConfig {
    /// Defaults, with the rate taken from `CMEMPROF_RATE` when set
    pub fn from_env() -> Result<Self> {
        let mut config = SessionConfig::default();
        if let Ok(rate) = std::env::var(ENV_RATE) {
            config.sampling_rate = parse_rate(&rate)?;
        }
        Ok(config)
    }

    pub fn with_sampling_rate(mut self, rate: i64) -> Self {
        self.sampling_rate = rate;
        self
    }
}

/// A running profile: the profiler is started and a drain thread folds
/// samples into a [`HeapProfile`] until [`Session::stop`].
pub struct Session<C: StackCapturer + 'static> {
    profiler: &'static Profiler<C>,
    drain: Option<JoinHandle<HeapProfile>>,
    started: Instant,
    overwritten_before: u64,
}

impl<C: StackCapturer + 'static> Session<C> {
    /// Start profiling. Only one session may drain a profiler at a time.
    pub fn start(profiler: &'static Profiler<C>, config: SessionConfig) -> Result<Self> {
        if config.sampling_rate <= 0 {
            return Err(cmemprof_trace::Error::InvalidRate(config.sampling_rate.to_string()).into());
        }
        if !profiler.try_claim_consumer() {
            return Err(Error::AlreadyRunning);
        }

        let mut profile = HeapProfile::new(profiler.policy(), config.sampling_rate);
        profile.started_at = Some(chrono::Utc::now());
        let overwritten_before = profiler.stats().overwritten;
        let max_frames = config.max_frames.clamp(1, MAX_STACK_DEPTH);

        // The drain exits on a stopped, empty buffer
        profiler.set_sampling_rate(config.sampling_rate);
        profiler.start();

        let spawned = std::thread::Builder::new()
            .name("cmemprof-drain".to_string())
            .spawn(move || {
                let _quiet = cmemprof_trace::suspend();
                let mut stack = Vec::with_capacity(max_frames);
                while let Some(sample) = profiler.next_sample(max_frames) {
                    stack.clear();
                    stack.extend(sample.stack.iter().map(|&pc| pc as u64));
                    profile.add_sample(&stack, sample.size);
                }
                profile
            });
        let drain = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                profiler.stop();
                profiler.release_consumer();
                return Err(Error::Session(format!("failed to spawn drain thread: {e}")));
            }
        };

        tracing::info!(
            rate = config.sampling_rate,
            policy = %profiler.policy(),
            "profiling session started"
        );

        Ok(Session {
            profiler,
            drain: Some(drain),
            started: Instant::now(),
            overwritten_before,
        })
    }

    pub fn is_running(&self) -> bool {
        self.drain.is_some()
    }

    /// Stop the profiler, wait for the drain thread to empty the buffer
    /// and return what it collected.
    pub fn stop(mut self) -> Result<HeapProfile> {
        self.finish()
    }

    fn finish(&mut self) -> Result<HeapProfile> {
        let drain = self
            .drain
            .take()
            .ok_or_else(|| Error::Session("session already stopped".to_string()))?;

        self.profiler.stop();
        let joined = drain.join();
        self.profiler.release_consumer();

        let mut profile =
            joined.map_err(|_| Error::Session("drain thread panicked".to_string()))?;
        profile.duration = self.started.elapsed();
        let overwritten = self
            .profiler
            .stats()
            .overwritten
            .saturating_sub(self.overwritten_before);
        profile.set_overwritten(overwritten);

        if overwritten > 0 {
            tracing::warn!(
                overwritten,
                "sample buffer overran, raise the sampling rate or buffer size"
            );
        }
        tracing::info!(
            samples = profile.sample_count(),
            stacks = profile.records().len(),
            "profiling session stopped"
        );
        Ok(profile)
    }
}

impl<C: StackCapturer + 'static> Drop for Session<C> {
    fn drop(&mut self) {
        if self.drain.is_some()
            && let Err(err) = self.finish()
        {
            tracing::warn!(%err, "failed to stop profiling session");
        }
    }
}
