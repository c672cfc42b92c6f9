use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Errors surfaced by filebox operations, on both ends of the wire.
///
/// Structural errors (`NotFound`, `AlreadyExists`, `NotEmpty`,
/// `InvalidHandle`, `NotADirectory`, `IsADirectory`, `InvalidPath`) describe
/// a fact about the namespace and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum FsError {
    /// The path (or a parent of it) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The destination name is already taken.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Attempted to delete a directory that still has children.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// The handle is unknown to the session or was opened with the wrong mode.
    #[error("invalid handle: {0}")]
    InvalidHandle(u64),

    /// A path component that must be a directory is a file.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// A file operation was attempted on a directory.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// The path is malformed or escapes the shared root.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The content store failed.
    #[error("I/O failure: {0}")]
    IoFailure(String),

    /// The connection to the server is gone.
    #[error("disconnected from server")]
    Disconnected,

    /// The request did not complete within its time budget.
    #[error("request timed out")]
    Timeout,

    /// The peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl FsError {
    /// Whether this error states a fact about the namespace rather than a
    /// transient failure.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            FsError::NotFound(_)
                | FsError::AlreadyExists(_)
                | FsError::NotEmpty(_)
                | FsError::InvalidHandle(_)
                | FsError::NotADirectory(_)
                | FsError::IsADirectory(_)
                | FsError::InvalidPath(_)
        )
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => FsError::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => FsError::Disconnected,
            _ => FsError::IoFailure(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for FsError {
    fn from(err: serde_json::Error) -> Self {
        FsError::Protocol(err.to_string())
    }
}

/// Result type for filebox operations.
pub type Result<T> = std::result::Result<T, FsError>;
