use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("A profiling session is already running in this process")]
    AlreadyRunning,

    #[error("Profiler setup failed: {0}")]
    Profiler(#[from] cmemprof_trace::Error),

    #[error("Profiling session failed: {0}")]
    Session(String),

    #[error("Missing debug info in {path}. Recompile with `debug = true` in Cargo.toml")]
    MissingDebugInfo { path: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Not a cmemprof profile: {0}")]
    NotAProfile(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Symbol resolution error: {0}")]
    SymbolResolution(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const INVALID_ARGUMENTS: i32 = 2;
    pub const SESSION_ERROR: i32 = 3;
    pub const MISSING_DEBUG_INFO: i32 = 5;
    pub const DATABASE_ERROR: i32 = 6;
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::AlreadyRunning | Error::Session(_) | Error::Profiler(_) => {
                exit_code::SESSION_ERROR
            }
            Error::MissingDebugInfo { .. } => exit_code::MISSING_DEBUG_INFO,
            Error::Database(_) | Error::NotAProfile(_) => exit_code::DATABASE_ERROR,
            Error::InvalidArgument(_) => exit_code::INVALID_ARGUMENTS,
            _ => exit_code::GENERAL_ERROR,
        }
    }
}
