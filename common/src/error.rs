//! Error types shared between `catchup-common` and `catchup-remote`.
//!
//! Component-specific errors (`PreflightError`, `ScanError`, `TransferError`,
//! ...) live in the `catchup` crate next to the component they belong to;
//! this module only holds the one error shape that both the local and
//! remote `DataDirIo` implementations need to agree on.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("I/O error at {path}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("remote capability error: {0}")]
    Remote(String),

    #[error("unexpected end of data directory stream")]
    UnexpectedEof,
}

impl IoError {
    pub fn at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Path {
            path: path.into(),
            source,
        }
    }
}

pub type IoResult<T> = Result<T, IoError>;
