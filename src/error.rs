use crate::domain::{ColumnKey, IssueId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Board not found: {0}")]
    BoardNotFound(String),

    #[error("Column not found: {0}")]
    ColumnNotFound(ColumnKey),

    #[error("No card for issue {0}")]
    CardNotFound(IssueId),

    #[error("Provider call {operation} failed: {message}")]
    Provider { operation: String, message: String },

    #[error("Publishing failed: {0}")]
    Publish(String),

    #[error("Invalid card content: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl SyncError {
    /// Builds a provider failure for the named operation
    pub fn provider(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Provider {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Whether the error means something is absent and may be provisioned
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BoardNotFound(_) | Self::ColumnNotFound(_) | Self::CardNotFound(_)
        )
    }

    /// Whether a later attempt against the same state could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provider { .. } | Self::Publish(_) | Self::IoError(_))
    }
}
