/// Storage failure with retry classification.
///
/// Only [`StoreError::Unavailable`] is transient. The runtime retries it with
/// backoff and never treats the failed operation as having happened; every
/// other variant is permanent for the call that produced it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable during {operation}: {message}")]
    Unavailable { operation: String, message: String },
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("instance already exists: {0}")]
    InstanceExists(String),
    /// The peek-lock token expired or was already settled.
    #[error("lock lost for token {0}")]
    LockLost(String),
    #[error("corrupt record in {location}: {message}")]
    Corrupt { location: String, message: String },
}

impl StoreError {
    pub fn unavailable(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Unavailable {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn corrupt(location: impl Into<String>, message: impl ToString) -> Self {
        Self::Corrupt {
            location: location.into(),
            message: message.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}
