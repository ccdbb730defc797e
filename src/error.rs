//! Comprehensive error types for the tasktree engine operations.
//!
//! This module defines the `TaskTreeError` enum covering all error
//! conditions that can occur during task scheduling, shared file-handle
//! caching, synchronization, and text translation.
//!
//! It also provides helper methods to construct errors and classify them.
use std::path::PathBuf;

use thiserror::Error;

/// Represents all possible errors in the tasktree engine.
///
/// Each variant provides specific context to facilitate debugging and
/// user-friendly reporting.
///
/// # Examples
///
/// ```rust
/// use tasktree::error::{TaskTreeError, TaskTreeResult};
///
/// fn example() -> TaskTreeResult<()> {
///     Err(TaskTreeError::Cancelled)
/// }
/// ```
#[derive(Error, Debug)]
pub enum TaskTreeError {
    /// A checked mutex was locked a second time by the thread that
    /// already owns it.
    #[error("Recursive locks are not supported")]
    RecursiveLock,

    /// A checked mutex was released by a thread that does not hold it,
    /// or was not released in an orderly way (e.g. the holder panicked).
    #[error("Tried to release a non-locked mutex")]
    InvalidUnlock,

    /// Task processing was cancelled, either cooperatively through the
    /// caller-supplied cancel function or because the engine is
    /// terminating.
    #[error("Operation cancelled")]
    Cancelled,

    /// A read ran past the end of the file and the caller did not ask
    /// for a byte count.
    #[error("Unexpected end of file '{path}'")]
    Eof {
        /// The file that hit end-of-file
        path: PathBuf,
    },

    /// The operating system returned fewer bytes than requested in the
    /// middle of the file.
    #[error("Incomplete read in file '{path}'")]
    IncompleteRead {
        /// The file with the short read
        path: PathBuf,
    },

    /// The file was opened without read access.
    #[error("No read access to file '{path}'")]
    NoReadAccess {
        /// The file opened write-only
        path: PathBuf,
    },

    /// The file was opened without write access.
    #[error("No write access to file '{path}'")]
    NoWriteAccess {
        /// The file opened read-only
        path: PathBuf,
    },

    /// The requested character set is not known to the translation
    /// helpers.
    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    /// Configuration error due to invalid or missing settings.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error
        message: String,
    },

    /// I/O operation failed during file system access.
    ///
    /// Wraps `std::io::Error` together with the path of the offending
    /// file so the failure is attributable.
    #[error("I/O error on file '{path}': {source}")]
    Io {
        /// The file the operation was issued against
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A worker thread could not be joined or ended abnormally.
    #[error("Worker thread failed: {message}")]
    ThreadJoin {
        /// Description of the join failure
        message: String,
    },

    /// An error reported together with further failures observed during
    /// the same run, typically worker thread join failures at shutdown.
    ///
    /// The primary error takes precedence; the rest ride along so they
    /// are not lost.
    #[error("{primary} ({} further failure(s) during shutdown)", .secondary.len())]
    Composed {
        /// The error that takes precedence
        primary: Box<TaskTreeError>,
        /// Additional errors, in the order they were observed
        secondary: Vec<TaskTreeError>,
    },

    /// Generic task failure raised from a user callback.
    #[error("{0}")]
    TaskFailed(String),

    /// Catch-all error variant wrapping any other failure.
    #[error("Unknown error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Specialized `Result` type for tasktree operations.
pub type TaskTreeResult<T> = Result<T, TaskTreeError>;

impl TaskTreeError {
    /// Create a configuration error with the given message.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use tasktree::error::TaskTreeError;
    /// let err = TaskTreeError::config("invalid setting");
    /// assert_eq!(err.to_string(), "Configuration error: invalid setting");
    /// ```
    pub fn config<S: Into<String>>(message: S) -> Self {
        TaskTreeError::Config {
            message: message.into(),
        }
    }

    /// Create an I/O error wrapping `source` with the offending `path`.
    pub fn io<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Self {
        TaskTreeError::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a task failure error with the given message.
    pub fn task_failed<S: Into<String>>(message: S) -> Self {
        TaskTreeError::TaskFailed(message.into())
    }

    /// Create a thread join error with the given message.
    pub fn thread_join<S: Into<String>>(message: S) -> Self {
        TaskTreeError::ThreadJoin {
            message: message.into(),
        }
    }

    /// Compose `primary` with `secondary` failures observed during the
    /// same run.
    ///
    /// Returns `primary` unchanged when there is nothing to attach.
    /// The primary error keeps precedence for classification; the
    /// secondary ones are preserved for diagnostics.
    pub fn compose(primary: TaskTreeError, secondary: Vec<TaskTreeError>) -> TaskTreeError {
        if secondary.is_empty() {
            primary
        } else {
            TaskTreeError::Composed {
                primary: Box::new(primary),
                secondary,
            }
        }
    }

    /// Return `true` if this error is a cooperative cancellation.
    ///
    /// A composed error classifies by its primary error.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use tasktree::error::TaskTreeError;
    /// assert!(TaskTreeError::Cancelled.is_cancelled());
    /// ```
    pub fn is_cancelled(&self) -> bool {
        match self {
            TaskTreeError::Cancelled => true,
            TaskTreeError::Composed { primary, .. } => primary.is_cancelled(),
            _ => false,
        }
    }
}

impl From<toml::de::Error> for TaskTreeError {
    fn from(err: toml::de::Error) -> Self {
        TaskTreeError::Config {
            message: format!("TOML deserialization error: {}", err),
        }
    }
}

// Unit test: TaskTreeError error types and helper methods
#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = TaskTreeError::config("test config error");
        assert!(matches!(error, TaskTreeError::Config { .. }));
        assert_eq!(error.to_string(), "Configuration error: test config error");
    }

    #[test]
    fn test_io_error_carries_path() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error = TaskTreeError::io("/tmp/data.bin", io_error);
        let msg = error.to_string();
        assert!(msg.contains("/tmp/data.bin"));
        assert!(msg.contains("file not found"));
    }

    #[test]
    fn test_cancelled_classification() {
        assert!(TaskTreeError::Cancelled.is_cancelled());
        assert!(!TaskTreeError::RecursiveLock.is_cancelled());
    }

    #[test]
    fn test_access_errors_name_the_file() {
        let error = TaskTreeError::NoReadAccess {
            path: "log.txt".into(),
        };
        assert!(error.to_string().contains("log.txt"));

        let error = TaskTreeError::NoWriteAccess {
            path: "log.txt".into(),
        };
        assert!(error.to_string().contains("No write access"));
    }

    #[test]
    fn test_anyhow_conversion() {
        let error: TaskTreeError = anyhow::anyhow!("boom").into();
        assert!(matches!(error, TaskTreeError::Other(_)));
    }

    #[test]
    fn test_compose_without_secondary_is_identity() {
        let error = TaskTreeError::compose(TaskTreeError::Cancelled, Vec::new());
        assert!(matches!(error, TaskTreeError::Cancelled));
    }

    #[test]
    fn test_compose_keeps_all_failures() {
        let error = TaskTreeError::compose(
            TaskTreeError::Cancelled,
            vec![
                TaskTreeError::thread_join("worker 1 died"),
                TaskTreeError::thread_join("worker 2 died"),
            ],
        );

        // Classification follows the primary error.
        assert!(error.is_cancelled());
        assert!(error.to_string().contains("2 further failure(s)"));

        match error {
            TaskTreeError::Composed { primary, secondary } => {
                assert!(primary.is_cancelled());
                assert_eq!(secondary.len(), 2);
                assert!(secondary[0].to_string().contains("worker 1 died"));
                assert!(secondary[1].to_string().contains("worker 2 died"));
            }
            other => panic!("expected a composed error, got {}", other),
        }
    }
}
