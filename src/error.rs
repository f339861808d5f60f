use thiserror::Error;

/// Errors returned by the object stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    /// The object changed since it was read; re-read and retry.
    #[error("conflict updating {kind} {key}: the object has been modified")]
    Conflict { kind: &'static str, key: String },

    #[error("invalid {kind}: {message}")]
    Invalid { kind: &'static str, message: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Errors surfaced by the instantiate, rollback and cancel operations.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request was valid but there was nothing to do.
    #[error("{0}")]
    NoContent(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            StoreError::AlreadyExists { .. } | StoreError::Conflict { .. } => {
                ApiError::Conflict(err.to_string())
            }
            StoreError::Invalid { message, .. } => ApiError::Invalid(message),
            other => ApiError::Store(other),
        }
    }
}

impl ApiError {
    pub fn is_no_content(&self) -> bool {
        matches!(self, ApiError::NoContent(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict(_))
    }
}

/// Outcome classes of a controller sync.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Already handled and logged; stop without requeueing.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Needs an operator; recorded as an event and not requeued.
    #[error("{0}")]
    Actionable(String),

    /// Worth another attempt after backoff.
    #[error("{0}")]
    Transient(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcileError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn actionable(msg: impl Into<String>) -> Self {
        Self::Actionable(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }
}
