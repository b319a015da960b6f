//! Error types for the context store.

use thiserror::Error;

/// Errors surfaced by store operations.
#[derive(Error, Debug)]
pub enum ContextError {
    /// Bad priority, unknown project, malformed payload.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Snapshot, project, or instance not present.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend failure that is not a plain SQLite error (worker join, setup).
    #[error("Store error: {0}")]
    Store(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type ContextResult<T> = Result<T, ContextError>;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Store,
}

impl ContextError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Store(_) | Self::Sqlite(_) | Self::Pool(_) | Self::Io(_) => ErrorKind::Store,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_prefix() {
        let err = ContextError::validation("unknown priority 'urgent'");
        assert_eq!(
            err.to_string(),
            "Validation error: unknown priority 'urgent'"
        );
    }

    #[test]
    fn backend_errors_fold_into_store_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: ContextError = io.into();
        assert_eq!(err.kind(), ErrorKind::Store);

        let err: ContextError = rusqlite::Error::InvalidQuery.into();
        assert_eq!(err.kind(), ErrorKind::Store);
    }

    #[test]
    fn not_found_is_distinct() {
        assert_eq!(
            ContextError::not_found("snapshot 9").kind(),
            ErrorKind::NotFound
        );
    }
}
