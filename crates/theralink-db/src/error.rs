use theralink_types::models::DraftError;

/// Store-layer failures. Callers decide how to surface them; nothing here retries.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// True for failures of the backing store itself rather than of the request.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Corrupt(_) | Self::Poisoned)
    }

    /// Map a UNIQUE/foreign-key violation to `Conflict`, anything else to `Database`.
    pub(crate) fn conflict_on_constraint(err: rusqlite::Error, context: &str) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Conflict(format!("{}: {}", context, err))
            }
            _ => Self::Database(err),
        }
    }
}

impl From<DraftError> for StoreError {
    fn from(err: DraftError) -> Self {
        Self::Validation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
