use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors surfaced by the control operations.
///
/// Nothing in this enum ever crosses an intercepted allocator call: trampolines swallow
/// engine failures and fall back to the original symbol.
#[derive(Debug, Error)]
pub enum Error {
    #[error("already running")]
    AlreadyRunning,

    #[error("not running")]
    NotRunning,

    #[error("not started")]
    NotStarted,

    #[error("invalid library filter {pattern:?}: {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("unusable storage directory {path:?}: {source}")]
    InvalidStorage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("storage directory required for large-map mode")]
    MissingStorage,

    #[error("failed to hook {symbol} in {library}: {source}")]
    HookInstall {
        library: String,
        symbol: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("symbol {symbol} not imported by {library}")]
    SymbolNotFound {
        library: String,
        symbol: &'static str,
    },

    #[error("diff requested but diff cache is disabled")]
    DiffDisabled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Stable numeric code used by the C ABI.
    pub fn code(&self) -> i32 {
        match self {
            Error::AlreadyRunning => -1,
            Error::NotRunning => -2,
            Error::NotStarted => -3,
            Error::InvalidFilter { .. } => -4,
            Error::InvalidStorage { .. } | Error::MissingStorage => -5,
            Error::HookInstall { .. } => -6,
            Error::SymbolNotFound { .. } => -7,
            Error::DiffDisabled => -8,
            Error::Io(_) => -9,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
