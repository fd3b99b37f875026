use std::error::Error as StdError;
use std::io;
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// Any failure that cannot be confidently attributed to any other error
    /// category in this enum.
    ///
    /// Internal is never a guarantee that the error is not caused by the
    /// caller, merely that it cannot be confidently determined by the code.
    Internal,

    /// The caller provided invalid input or requested something that is
    /// unsupported or impossible to complete.
    User,
}

/// Fine-grained condition flags for consumers that want to branch on error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The handle provider failed to open the file (permissions, missing
    /// file, or an existing file under an exclusive flag).
    OpenFailed,
    /// A write against an open handle failed.
    WriteFailed,
    /// A read against an open handle failed.
    ReadFailed,
    /// Releasing the handle failed.
    CloseFailed,
    /// Bad encoding name, flag string, mode, path or option value.
    InvalidArgument,
    /// The option combination is recognized but deliberately unsupported.
    NotImplemented,
    /// The operation was attempted on a stream that has been torn down.
    Destroyed,
}

#[derive(Debug, Clone, Error)]
#[error("{msg}")]
pub struct StreamError {
    /// Broad error category, always provided.
    pub category: ErrorCategory,
    /// Optional specific condition tag for consumers that need to
    /// branch their behavior. Any code consuming errors MUST handle
    /// the absence of a defined kind.
    pub kind: Option<ErrorKind>,
    #[source]
    source: Option<Arc<dyn StdError + Send + Sync + 'static>>,
    msg: String,
}

impl StreamError {
    /// Creates a new error with a required category and display message.
    pub fn new(category: ErrorCategory, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind: None,
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that also tags the failure with a kind.
    pub fn with_kind(category: ErrorCategory, kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that retains the originating source error.
    pub fn with_source(
        category: ErrorCategory,
        msg: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            category,
            kind: None,
            source: Some(Arc::new(source)),
            msg: msg.into(),
        }
    }

    /// Creates a new error that carries both a kind tag and the originating source error.
    pub fn with_kind_and_source(
        category: ErrorCategory,
        kind: ErrorKind,
        msg: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: Some(Arc::new(source)),
            msg: msg.into(),
        }
    }

    /// Shorthand for the synchronous argument-validation failures.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorCategory::User, ErrorKind::InvalidArgument, msg)
    }

    /// Wraps an I/O failure reported by a handle provider.
    ///
    /// Missing files and permission problems are attributed to the caller,
    /// everything else is internal.
    pub fn io(kind: ErrorKind, msg: impl Into<String>, err: io::Error) -> Self {
        let category = match err.kind() {
            io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::AlreadyExists => ErrorCategory::User,
            _ => ErrorCategory::Internal,
        };
        Self::with_kind_and_source(category, kind, msg, err)
    }

    /// The user-facing message carried by the error.
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Returns the preserved source error if present.
    pub fn source_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Returns the `std::io::ErrorKind` of the innermost I/O source, if any.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        let source = self.source_error()?;
        if let Some(io_err) = source.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        source
            .downcast_ref::<StreamError>()
            .and_then(StreamError::io_kind)
    }

    /// Wraps the current error with a higher-level message while preserving the original as source.
    pub fn with_context(self, msg: impl Into<String>) -> Self {
        let category = self.category;
        let kind = self.kind;
        Self {
            category,
            kind,
            source: Some(Arc::new(self)),
            msg: msg.into(),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_category_mapping() {
        let err = StreamError::io(
            ErrorKind::OpenFailed,
            "failed to open",
            io::Error::from(io::ErrorKind::NotFound),
        );
        assert_eq!(err.category, ErrorCategory::User);
        assert_eq!(err.kind, Some(ErrorKind::OpenFailed));

        let err = StreamError::io(
            ErrorKind::WriteFailed,
            "failed to write",
            io::Error::other("disk on fire"),
        );
        assert_eq!(err.category, ErrorCategory::Internal);
    }

    #[test]
    fn test_context_preserves_kind_and_io_source() {
        let err = StreamError::io(
            ErrorKind::CloseFailed,
            "close failed",
            io::Error::from(io::ErrorKind::BrokenPipe),
        )
        .with_context("while tearing down");

        assert_eq!(err.message(), "while tearing down");
        assert_eq!(err.kind, Some(ErrorKind::CloseFailed));
        assert_eq!(err.io_kind(), Some(io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn test_clone_shares_source() {
        let err = StreamError::io(
            ErrorKind::ReadFailed,
            "read failed",
            io::Error::from(io::ErrorKind::UnexpectedEof),
        );
        let cloned = err.clone();
        assert_eq!(cloned.to_string(), "read failed");
        assert_eq!(cloned.io_kind(), Some(io::ErrorKind::UnexpectedEof));
    }
}
