use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the durable queue (used by the `QueueRepository` port in conduit-core).
#[derive(Debug, Error)]
pub enum QueueError {
    /// Storage is unreachable or a statement failed. Fatal to the caller.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("queue '{0}' does not exist")]
    QueueNotFound(String),

    /// Only returned by strict creation.
    #[error("queue '{0}' already exists")]
    AlreadyExists(String),

    #[error("invalid queue name '{0}'")]
    InvalidName(String),
}

/// Errors from repository operations (used by trait definitions in conduit-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Failure taxonomy shared by the executor, the router and the result envelope.
///
/// Every failure is resolved to exactly one kind and recorded on the step or
/// instance before any notification goes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Queue or store unavailable.
    StorageError,
    /// A step exceeded its declared timeout.
    StepTimeout,
    /// A step worker returned an explicit error.
    StepError,
    /// A step was never attempted because an ancestor failed permanently.
    DependencyFailure,
    /// The router found no handler for a message tag.
    UnknownMessageType,
    /// A worker panicked; caught at the step boundary.
    ExecutorCrash,
}

impl ErrorKind {
    /// Whether a failure of this kind consumes an attempt and may be retried.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::StepTimeout | ErrorKind::StepError | ErrorKind::ExecutorCrash
        )
    }

    /// Whether re-submitting the same work later could plausibly succeed.
    ///
    /// Surfaced to result-queue consumers as `recovery_suggested`.
    pub fn recovery_suggested(self) -> bool {
        matches!(
            self,
            ErrorKind::StorageError | ErrorKind::StepTimeout | ErrorKind::ExecutorCrash
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::StorageError => "storage_error",
            ErrorKind::StepTimeout => "step_timeout",
            ErrorKind::StepError => "step_error",
            ErrorKind::DependencyFailure => "dependency_failure",
            ErrorKind::UnknownMessageType => "unknown_message_type",
            ErrorKind::ExecutorCrash => "executor_crash",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "storage_error" => Ok(ErrorKind::StorageError),
            "step_timeout" => Ok(ErrorKind::StepTimeout),
            "step_error" => Ok(ErrorKind::StepError),
            "dependency_failure" => Ok(ErrorKind::DependencyFailure),
            "unknown_message_type" => Ok(ErrorKind::UnknownMessageType),
            "executor_crash" => Ok(ErrorKind::ExecutorCrash),
            other => Err(format!("unknown error kind: '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::QueueNotFound("ingest_requests".to_string());
        assert_eq!(err.to_string(), "queue 'ingest_requests' does not exist");
    }

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_error_kind_retryability() {
        assert!(ErrorKind::StepTimeout.is_retryable());
        assert!(ErrorKind::StepError.is_retryable());
        assert!(ErrorKind::ExecutorCrash.is_retryable());
        assert!(!ErrorKind::DependencyFailure.is_retryable());
        assert!(!ErrorKind::UnknownMessageType.is_retryable());
        assert!(!ErrorKind::StorageError.is_retryable());
    }

    #[test]
    fn test_error_kind_string_roundtrip() {
        for kind in [
            ErrorKind::StorageError,
            ErrorKind::StepTimeout,
            ErrorKind::StepError,
            ErrorKind::DependencyFailure,
            ErrorKind::UnknownMessageType,
            ErrorKind::ExecutorCrash,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
        assert!("nope".parse::<ErrorKind>().is_err());
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::DependencyFailure).unwrap();
        assert_eq!(json, "\"dependency_failure\"");
    }
}
