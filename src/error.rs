//! Error types for the GSEA pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type of the crate.
///
/// The four domain variants mirror the stages of a run: malformed input
/// files (`Parse`), invalid parameter combinations (`Config`), structurally
/// invalid in-memory data (`Data`) and failed lookups (`NotFound`).
#[derive(Error, Debug)]
pub enum GseaError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error in '{path}' (line {line}): {msg}")]
    Parse {
        path: PathBuf,
        line: usize,
        msg: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid data: {0}")]
    Data(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to build the permutation worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("plotting failed: {0}")]
    Plot(String),
}

impl GseaError {
    /// Shorthand for a parse error at a given (1-based) line
    pub fn parse(path: &std::path::Path, line: usize, msg: impl Into<String>) -> Self {
        GseaError::Parse {
            path: path.to_path_buf(),
            line,
            msg: msg.into(),
        }
    }

    /// Wrap an I/O error together with the offending path
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        GseaError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl<E> From<plotters::drawing::DrawingAreaErrorKind<E>> for GseaError
where
    E: std::error::Error + Send + Sync,
{
    fn from(err: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        GseaError::Plot(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GseaError>;
