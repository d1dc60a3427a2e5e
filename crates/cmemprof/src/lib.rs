//! Consumer side of the cmemprof heap profiler: drains samples from a
//! running [`cmemprof_trace::Profiler`], aggregates them per call stack,
//! symbolizes the stacks against the running executable and stores the
//! result in SQLite for the `cmemprof` CLI to report on, or exports it as
//! a pprof profile.

pub mod cli;
pub mod commands;
pub mod error;
pub mod export;
pub mod process;
pub mod profile;
pub mod storage;
pub mod symbols;
pub mod workload;

pub use error::{Error, Result};
