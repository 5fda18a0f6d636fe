use thiserror::Error;
use tokio::task::JoinError;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Store rejected {operation} on '{collection}': {reason}")]
    Store {
        operation: &'static str,
        collection: String,
        reason: String,
    },

    #[error("Document '{id}' does not exist in '{collection}'")]
    DocumentNotFound { collection: String, id: String },

    #[error("Store does not support {operation}")]
    Unsupported { operation: &'static str },

    #[error("Local storage I/O failed: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("Failed to (de)serialize JSON: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Local storage is unavailable: {reason}")]
    StorageUnavailable { reason: String },

    #[error(
        "Tried to subscribe to '{collection}' multiple times. A subscription must be torn down before it is activated again"
    )]
    AlreadySubscribed { collection: String },

    #[error("Chat session is already shut down")]
    SessionClosed,

    #[error("Task panicked or was cancelled: {0}")]
    TaskPanic(#[from] JoinError),
}

impl ChatError {
    pub fn store(
        operation: &'static str,
        collection: &str,
        reason: impl Into<String>,
    ) -> Self {
        ChatError::Store {
            operation,
            collection: String::from(collection),
            reason: reason.into(),
        }
    }
}
