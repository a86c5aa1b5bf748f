//! Error taxonomy for a merge run.
//!
//! Every per-file condition is a [`MergeError`] variant so the orchestrator can
//! record it against the file and move on. Only [`MergeError::is_fatal`] errors
//! stop a run; they surface to callers wrapped in a [`MergeAbort`] that still
//! carries the statistics gathered up to that point.

use std::{io, path::PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::merge::MergeRunStats;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("{path:?}: unsupported file extension '{extension}'")]
    UnsupportedFormat { path: PathBuf, extension: String },

    #[error("{path:?}: none of the candidate encodings ({candidates}) could decode the file")]
    EncodingUnresolvable { path: PathBuf, candidates: String },

    #[error("{path:?} line {line}: {reason}")]
    MalformedRow {
        path: PathBuf,
        line: u64,
        reason: String,
    },

    #[error("{path:?}: column signature {found:?} does not match reference {expected:?}")]
    SchemaMismatch {
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("{path:?}: {message}")]
    ReaderFailure { path: PathBuf, message: String },

    #[error("writing {path:?} failed: {source}")]
    WriterFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("listing input directory {path:?} failed: {source}")]
    InputDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Serializable tag for a [`MergeError`] variant, used in run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnsupportedFormat,
    EncodingUnresolvable,
    MalformedRow,
    SchemaMismatch,
    ReaderFailure,
    WriterFailure,
    InputDirectory,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FailureKind::UnsupportedFormat => "UnsupportedFormat",
            FailureKind::EncodingUnresolvable => "EncodingUnresolvable",
            FailureKind::MalformedRow => "MalformedRow",
            FailureKind::SchemaMismatch => "SchemaMismatch",
            FailureKind::ReaderFailure => "ReaderFailure",
            FailureKind::WriterFailure => "WriterFailure",
            FailureKind::InputDirectory => "InputDirectory",
        };
        f.write_str(label)
    }
}

impl MergeError {
    /// Wraps a decoder error (with its context chain) as a reader failure for `path`.
    pub fn reader(path: impl Into<PathBuf>, err: impl Into<anyhow::Error>) -> Self {
        MergeError::ReaderFailure {
            path: path.into(),
            message: format!("{:#}", err.into()),
        }
    }

    pub fn writer(path: impl Into<PathBuf>, source: impl Into<io::Error>) -> Self {
        MergeError::WriterFailure {
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            MergeError::UnsupportedFormat { .. } => FailureKind::UnsupportedFormat,
            MergeError::EncodingUnresolvable { .. } => FailureKind::EncodingUnresolvable,
            MergeError::MalformedRow { .. } => FailureKind::MalformedRow,
            MergeError::SchemaMismatch { .. } => FailureKind::SchemaMismatch,
            MergeError::ReaderFailure { .. } => FailureKind::ReaderFailure,
            MergeError::WriterFailure { .. } => FailureKind::WriterFailure,
            MergeError::InputDirectory { .. } => FailureKind::InputDirectory,
        }
    }

    /// Fatal errors end the run; everything else rejects a single file.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MergeError::WriterFailure { .. } | MergeError::InputDirectory { .. }
        )
    }
}

/// A run that stopped before finalizing.
#[derive(Debug, Error)]
#[error("merge aborted after {} row(s): {error}", .stats.rows_written)]
pub struct MergeAbort {
    pub stats: MergeRunStats,
    #[source]
    pub error: MergeError,
}
