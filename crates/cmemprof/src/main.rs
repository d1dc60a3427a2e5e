use anyhow::Context;
use clap::Parser;
use cmemprof::cli::{Cli, Command};
use cmemprof::commands::record::{self, RecordOptions};
use cmemprof::error::exit_code;
use cmemprof::profile::SessionConfig;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

cmemprof_trace::profiler!();

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(err) = e.downcast_ref::<cmemprof::Error>() {
                ExitCode::from(err.exit_code() as u8)
            } else {
                ExitCode::from(exit_code::GENERAL_ERROR as u8)
            }
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    cli.validate().map_err(cmemprof::Error::InvalidArgument)?;

    match cli.command {
        Command::Record {
            output,
            duration,
            rate,
            policy,
            unwinder,
            threads,
            slots,
            pprof,
        } => {
            let mut session = SessionConfig::from_env()?;
            if let Some(rate) = rate {
                session.sampling_rate = rate;
            }
            let opts = RecordOptions {
                output,
                duration,
                session,
                policy,
                unwinder: unwinder.unwrap_or_default(),
                threads,
                slots,
                pprof,
            };
            let running = record::interrupt_flag()?;
            let summary = record::run(&opts, &running).context("Recording failed")?;
            println!("{}", summary.path.display());
        }
        Command::Top {
            file,
            top,
            threshold,
            json,
            csv,
            filter,
        } => {
            let profile_path = match file {
                Some(f) => f,
                None => cmemprof::commands::list::most_recent_profile(std::path::Path::new("."))?
                    .ok_or_else(|| {
                        anyhow::anyhow!(
                            "No profiles found. Run 'cmemprof record' to create one."
                        )
                    })?,
            };
            cmemprof::commands::top::run(
                &profile_path,
                top,
                threshold,
                json,
                csv,
                filter.as_deref(),
            )?;
        }
        Command::Query { file, sql } => {
            cmemprof::commands::query::run(&file, &sql)?;
        }
        Command::List { dir } => {
            cmemprof::commands::list::run(dir.as_deref())?;
        }
        Command::Completions { shell } => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "cmemprof", &mut std::io::stdout());
        }
    }

    Ok(())
}
