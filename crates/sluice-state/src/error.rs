//! State backend error types.

/// Errors produced by [`StateBackend`](crate::StateBackend) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// `SQLite` failure with the operation that caused it.
    #[error("sqlite error during {context}: {source}")]
    SqliteContext {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored document could not be encoded or decoded.
    #[error("corrupt {what} document for pipeline '{pipeline}': {source}")]
    Document {
        what: &'static str,
        pipeline: String,
        #[source]
        source: serde_json::Error,
    },

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state backend lock poisoned")]
    LockPoisoned,
}

impl StateError {
    pub(crate) fn context(context: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::SqliteContext { context, source }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_error_displays_context() {
        let inner = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(1),
            Some("table not found".into()),
        );
        let err = StateError::context("commit: begin tx")(inner);
        let msg = err.to_string();
        assert!(msg.contains("sqlite"), "got: {msg}");
        assert!(msg.contains("commit: begin tx"), "got: {msg}");
    }

    #[test]
    fn lock_poisoned_displays() {
        let err = StateError::LockPoisoned;
        assert_eq!(err.to_string(), "state backend lock poisoned");
    }

    #[test]
    fn document_error_names_pipeline() {
        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = StateError::Document {
            what: "state",
            pipeline: "chess".into(),
            source,
        };
        assert!(err.to_string().starts_with("corrupt state document for pipeline 'chess'"));
    }
}
