use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("The specified key does not exist: {key}")]
    NotFound { key: String },

    #[error("Data integrity check failed for {key} after {attempts} attempts: calculated md5 {calculated} does not match ETag {reported}")]
    Integrity {
        key: String,
        attempts: u32,
        calculated: String,
        reported: String,
    },

    #[error("Precondition failed writing {key}: the object changed since it was read")]
    PreconditionFailed { key: String },

    #[error("Storage {operation} failed for '{target}': {message}")]
    Transient {
        operation: &'static str,
        target: String,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, ObjectStoreError>;

impl ObjectStoreError {
    pub fn not_found(key: impl Into<String>) -> Self {
        ObjectStoreError::NotFound { key: key.into() }
    }

    pub fn transient(
        operation: &'static str,
        target: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        ObjectStoreError::Transient {
            operation,
            target: target.into(),
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ObjectStoreError::NotFound { .. })
    }

    /// Whether repeating the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ObjectStoreError::Transient { .. })
    }
}
