use thiserror::Error;

/// The error taxonomy for the engine. Variant names follow the kinds listed
/// in the design's error-handling section rather than any one subsystem.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not empty: {0}")]
    NotEmpty(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("data corrupted: {0}")]
    DataCorrupted(String),

    #[error("no active transaction")]
    NoTransaction,

    #[error("transaction timed out")]
    Timeout,

    #[error("retryable busy: {0}")]
    RetryableBusy(String),

    #[error("backend failure: {0}")]
    BackendFailure(String),

    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Matches the default retryable predicate from the metadata store's
    /// transaction contract: substrings `SQLITE_BUSY`, `database is locked`,
    /// `cannot start a transaction within a transaction`.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        let msg = self.to_string();
        matches!(self, Self::RetryableBusy(_))
            || msg.contains("SQLITE_BUSY")
            || msg.contains("database is locked")
            || msg.contains("cannot start a transaction within a transaction")
    }
}
