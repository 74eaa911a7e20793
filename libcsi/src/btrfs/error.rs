//! Errors raised by the btrfs subvolume layer.

use std::path::PathBuf;

use thiserror::Error;

use crate::error::CsiError;

/// A failure to decode a `btrfs filesystem usage --raw` report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{key}: {value:?} is not a base-10 integer")]
    InvalidInteger { key: String, value: String },

    #[error("{key}: {value:?} is not a decimal ratio")]
    InvalidRatio { key: String, value: String },

    #[error("{key}: expected yes/no, got {value:?}")]
    InvalidFlag { key: String, value: String },

    #[error("report has no {key:?} field")]
    MissingField { key: String },
}

#[derive(Debug, Error)]
pub enum BtrfsError {
    /// The tool could not be started at all (missing binary, permissions).
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran and exited non-zero.  `output` is stdout followed by
    /// stderr, unmodified.
    #[error("`{command}` exited with {}: {output}", exit_code(.code))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("failed to parse btrfs output: {0}")]
    Parse(#[from] ParseError),

    #[error("quotas are not enabled on {}", .0.display())]
    QuotaUnsupported(PathBuf),

    #[error("{} is not on a btrfs filesystem: {output}", .path.display())]
    NotBtrfs { path: PathBuf, output: String },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "signal".to_owned(),
    }
}

impl BtrfsError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<BtrfsError> for CsiError {
    fn from(e: BtrfsError) -> Self {
        CsiError::Internal(e.to_string())
    }
}
