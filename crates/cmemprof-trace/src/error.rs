use thiserror::Error;

/// Errors from profiler setup. Nothing on the allocation path returns these;
/// a failed sample is simply dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid sampling rate: {0}")]
    InvalidRate(String),

    #[error("Sample buffer needs at least one slot, got {0}")]
    InvalidCapacity(usize),

    #[error("Unknown sampling policy '{0}' (expected 'uniform' or 'size-weighted')")]
    UnknownPolicy(String),

    #[error("Unknown stack capturer '{0}' (expected 'frame-pointer' or 'unwind')")]
    UnknownCapturer(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidEnv { var: String, message: String },

    #[error("The process-wide profiler is already initialized")]
    AlreadyInitialized,
}

pub type Result<T> = std::result::Result<T, Error>;
