use core_library::LibraryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Record {record_id} is locked by {locked_by}")]
    LockContention { record_id: String, locked_by: String },

    #[error("Integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("Data loss: {0}")]
    DataLoss(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote sync timeout after {0} seconds")]
    Timeout(u64),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{entity_type} {id} not found")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid input: {field} - {message}")]
    InvalidInput { field: String, message: String },

    #[error("Sync already in progress for user {user_id}")]
    SyncInProgress { user_id: String },

    #[error("Sync is disabled")]
    SyncDisabled,

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),
}

impl SyncError {
    pub(crate) fn not_found(entity_type: &str, id: impl Into<String>) -> Self {
        SyncError::NotFound {
            entity_type: entity_type.to_string(),
            id: id.into(),
        }
    }

    pub(crate) fn invalid_value(field: &str, value: &str) -> Self {
        SyncError::InvalidInput {
            field: field.to_string(),
            message: format!("Unknown value: {}", value),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
