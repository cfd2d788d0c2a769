//! Error types for script execution.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort a script or a planning step.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The operator cancelled the script.
    #[error("Operation cancelled")]
    Cancelled,

    /// Permission denied for a path.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    /// Path not found.
    #[error("Path not found: {path}")]
    NotFound { path: PathBuf },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unrecoverable condition (out of memory, runtime gone).
    #[error("Fatal error: {message}")]
    Fatal { message: String },

    /// Invalid configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The requested operation cannot be planned.
    #[error("Cannot plan {path}: {message}")]
    Plan { path: PathBuf, message: String },
}

impl EngineError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { path, source },
        }
    }

    /// Create a planning error.
    pub fn plan(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Plan {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Whether this error is an operator cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_io() {
        let err = EngineError::io(
            "/test/path",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(matches!(err, EngineError::PermissionDenied { .. }));

        let err = EngineError::io("/test/path", std::io::Error::other("boom"));
        assert!(matches!(err, EngineError::Io { .. }));
    }

    #[test]
    fn test_cancelled() {
        assert!(EngineError::Cancelled.is_cancelled());
        assert!(!EngineError::fatal("oom").is_cancelled());
    }
}
