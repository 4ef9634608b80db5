//! Error types for the strata engine.

use std::path::PathBuf;
use thiserror::Error;

/// Error type shared by all strata crates.
#[derive(Error, Debug)]
pub enum Error {
    /// A file could not be opened.
    #[error("could not open {}", path.display())]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A read came back short or failed outright.
    #[error("could not read {}", path.display())]
    FileRead { path: PathBuf },

    /// A write failed, most likely disk exhaustion.
    #[error("could not write {}", path.display())]
    FileWrite { path: PathBuf },

    /// A rename failed; both endpoints are reported.
    #[error("could not rename {} to {}", from.display(), to.display())]
    FileRename { from: PathBuf, to: PathBuf },

    /// An internal invariant was violated. Carries the construction
    /// site for diagnostics.
    #[error("internal inconsistency in {context} ({file}:{line})")]
    Inconsistency {
        context: &'static str,
        file: &'static str,
        line: u32,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// WAV codec error.
    #[error("WAV codec error: {0}")]
    Wav(#[from] hound::Error),
}

impl Error {
    /// Build an [`Error::Inconsistency`] recording the caller's
    /// source location.
    #[track_caller]
    pub fn inconsistency(context: &'static str) -> Self {
        let loc = std::panic::Location::caller();
        Error::Inconsistency {
            context,
            file: loc.file(),
            line: loc.line(),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
