use serde::Serialize;
use thiserror::Error;

/// Errors surfaced to the caller of a queue operation.
///
/// None of these are fatal to the process. Persistence failures are logged
/// and retried on the next save tick; everything else is returned to the
/// immediate caller only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Entry not found")]
    EntryNotFound,

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Already in queue")]
    AlreadyQueued,

    #[error("Not authenticated")]
    Unauthenticated,

    #[error("User is not staff")]
    NotStaff,

    #[error("You do not have permission to do that")]
    Forbidden,

    #[error("Queue is closed")]
    QueueClosed,

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Upstream service unavailable: {0}")]
    Unavailable(String),
}

impl QueueError {
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::EntryNotFound => "entry_not_found",
            QueueError::QueueNotFound(_) => "queue_not_found",
            QueueError::AlreadyQueued => "already_queued",
            QueueError::Unauthenticated => "unauthenticated",
            QueueError::NotStaff => "not_staff",
            QueueError::Forbidden => "forbidden",
            QueueError::QueueClosed => "queue_closed",
            QueueError::Validation(_) => "validation",
            QueueError::Persistence(_) => "persistence",
            QueueError::Unavailable(_) => "unavailable",
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        QueueError::Validation(msg.into())
    }
}

/// Wire form of a [`QueueError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl From<&QueueError> for ErrorBody {
    fn from(err: &QueueError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}
