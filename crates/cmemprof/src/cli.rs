use clap::{Parser, Subcommand};
use cmemprof_trace::{CaptureStrategy, SamplingPolicy};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "cmemprof")]
#[command(about = "In-process sampling heap profiler")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log debug output (RUST_LOG overrides)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Profile the built-in allocation workload and save the result
    Record {
        /// Output database path
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,

        /// Recording duration (default: until Ctrl-C)
        #[arg(long, short = 'd', value_parser = parse_duration)]
        duration: Option<Duration>,

        /// Sampling rate: bytes per sample (size-weighted) or allocations
        /// per sample (uniform). Accepts K/M/G suffixes.
        #[arg(long, short = 'r', value_parser = parse_rate)]
        rate: Option<i64>,

        /// Sampling policy
        #[arg(long, default_value = "size-weighted", value_parser = parse_policy)]
        policy: SamplingPolicy,

        /// Stack capture strategy (default: frame-pointer where supported)
        #[arg(long, value_parser = parse_unwinder)]
        unwinder: Option<CaptureStrategy>,

        /// Workload threads
        #[arg(long, short = 't', default_value = "4")]
        threads: usize,

        /// Sample buffer slots
        #[arg(long, default_value_t = cmemprof_trace::DEFAULT_BUFFER_SLOTS)]
        slots: usize,

        /// Also write the profile in pprof format
        #[arg(long, value_name = "FILE")]
        pprof: Option<PathBuf>,
    },

    /// View top allocation sites from a recorded profile
    Top {
        /// Profile database file (defaults to most recent)
        file: Option<PathBuf>,

        /// Number of entries to display
        #[arg(long, short = 'n', default_value = "20")]
        top: usize,

        /// Minimum percentage of total bytes to display
        #[arg(long, short = 't', default_value = "0")]
        threshold: f64,

        /// Output as JSON
        #[arg(long, conflicts_with = "csv")]
        json: bool,

        /// Output as CSV
        #[arg(long)]
        csv: bool,

        /// Filter by file or function name
        #[arg(long, short = 'f')]
        filter: Option<String>,
    },

    /// Execute raw SQL query on a profile database
    Query {
        /// Profile database file
        file: PathBuf,

        /// SQL query to execute
        sql: String,
    },

    /// List saved profile databases
    List {
        /// Directory to search (defaults to current directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }

    // Bare number as seconds
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    Err(format!(
        "Invalid duration '{}'. Examples: 30s, 5m, 2h, 1h30m, 90",
        s
    ))
}

fn parse_rate(s: &str) -> Result<i64, String> {
    cmemprof_trace::parse_rate(s).map_err(|e| e.to_string())
}

fn parse_policy(s: &str) -> Result<SamplingPolicy, String> {
    s.parse().map_err(|e: cmemprof_trace::Error| e.to_string())
}

fn parse_unwinder(s: &str) -> Result<CaptureStrategy, String> {
    s.parse().map_err(|e: cmemprof_trace::Error| e.to_string())
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        match &self.command {
            Command::Record { threads, slots, .. } => {
                if *threads == 0 || *threads > 256 {
                    return Err(format!(
                        "Workload threads must be between 1 and 256, got {}",
                        threads
                    ));
                }
                if *slots == 0 {
                    return Err("Sample buffer needs at least one slot".to_string());
                }
            }
            Command::Top { threshold, .. } => {
                if !(0.0..=100.0).contains(threshold) {
                    return Err(format!(
                        "Threshold must be a percentage between 0 and 100, got {}",
                        threshold
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_record_args() {
        let cli = Cli::try_parse_from([
            "cmemprof", "record", "-d", "5s", "--rate", "512K", "--policy", "uniform",
            "--unwinder", "unwind", "--pprof", "heap.pprof",
        ])
        .unwrap();
        match cli.command {
            Command::Record {
                duration,
                rate,
                policy,
                unwinder,
                threads,
                pprof,
                ..
            } => {
                assert_eq!(duration, Some(Duration::from_secs(5)));
                assert_eq!(rate, Some(512 * 1024));
                assert_eq!(policy, SamplingPolicy::Uniform);
                assert_eq!(unwinder, Some(CaptureStrategy::Unwind));
                assert_eq!(threads, 4);
                assert_eq!(pprof, Some(PathBuf::from("heap.pprof")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_validate() {
        let cli = Cli::try_parse_from(["cmemprof", "record", "--threads", "0"]).unwrap();
        assert!(cli.validate().is_err());

        let cli = Cli::try_parse_from(["cmemprof", "top", "--threshold", "150"]).unwrap();
        assert!(cli.validate().is_err());

        let cli = Cli::try_parse_from(["cmemprof", "top", "x.db", "--json"]).unwrap();
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_json_conflicts_with_csv() {
        assert!(Cli::try_parse_from(["cmemprof", "top", "--json", "--csv"]).is_err());
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
