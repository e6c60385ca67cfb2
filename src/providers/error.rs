/// Task-hub error with retry classification
///
/// Hubs return this error type so the runtime can decide whether an operation
/// is worth retrying. Instance-level outcomes (`InstanceNotFound`,
/// `DuplicateInstance`, `InvalidState`, `InvalidToken`) are never retried;
/// `Backend` errors carry their own classification.
///
/// # Example Usage
///
/// ```rust,no_run
/// use durotask::providers::TaskHubError;
///
/// # fn example() -> Result<(), TaskHubError> {
/// return Err(TaskHubError::retryable("complete_orchestration_work_item", "store is busy"));
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskHubError {
    #[error("instance '{0}' not found")]
    InstanceNotFound(String),
    #[error("instance '{0}' already exists")]
    DuplicateInstance(String),
    #[error("instance '{instance_id}' is in an invalid state: {message}")]
    InvalidState { instance_id: String, message: String },
    /// The work-item token is unknown or was already acknowledged.
    #[error("invalid work item token '{0}'")]
    InvalidToken(String),
    #[error("{operation}: {message}")]
    Backend {
        operation: String,
        message: String,
        retryable: bool,
    },
}

impl TaskHubError {
    /// Transient backend failure that may succeed on retry.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Backend failure that will not succeed on retry.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn invalid_state(instance_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidState {
            instance_id: instance_id.into(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskHubError::Backend { retryable: true, .. })
    }
}
