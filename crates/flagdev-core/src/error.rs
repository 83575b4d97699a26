use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("I/O error: {0}")]
    Io(String),
}

impl CoreError {
    /// Shorthand for a `StorageError::NotFound` wrapped in a `CoreError`.
    pub fn not_found(what: impl Into<String>) -> Self {
        CoreError::Storage(StorageError::NotFound(what.into()))
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("Invalid context: {0}")]
    InvalidContext(String),

    #[error("Invalid pagination: {0}")]
    InvalidPagination(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

#[derive(Error, Debug, PartialEq)]
pub enum StorageError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("Invalid backup: {0}")]
    InvalidBackup(String),

    #[error("Database error: {0}")]
    Database(String),
}

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("request failed: {0}")]
    Http(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}
