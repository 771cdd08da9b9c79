//! Facade error taxonomy and writer-level errors.

use std::time::Duration;
use thiserror::Error;

/// The error taxonomy every [`crate::facade::ServiceFacade`] implementation
/// maps its underlying transport errors onto. This is the vocabulary the
/// writer's retry/statistics/logging policy is built against - it is
/// deliberately coarser than any one cloud API's real status codes.
#[derive(Debug, Error)]
pub enum FacadeError {
    /// The destination is rejecting requests due to rate limiting.
    /// Retried with exponential backoff until the send deadline.
    #[error("throttled by destination")]
    Throttling {
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The destination aborted the request (e.g. connection reset
    /// mid-flight). Retried once, then surfaced.
    #[error("request aborted")]
    Aborted {
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The destination (group, stream, or topic) does not exist.
    #[error("destination not found: {name}")]
    MissingResource { name: String },

    /// The destination name, ARN, or another piece of configuration is
    /// structurally invalid. Never retried.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// The group-and-stream log service rejected the sequence token
    /// presented with a send. The facade re-fetches the current token and
    /// retries the same batch once internally; this variant should not
    /// usually escape the facade.
    #[error("invalid sequence token")]
    InvalidSequenceToken,

    /// The service recognized this batch as already accepted
    /// (deduplicated server-side). Treated as success by the writer.
    #[error("already processed")]
    AlreadyProcessed,

    /// An error kind not anticipated by this taxonomy. Retried with
    /// backoff until the deadline, then surfaced with its cause chain.
    #[error("unexpected error")]
    Unexpected {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl FacadeError {
    /// Whether the writer's retry policy calls for retrying this kind of
    /// error at all (as opposed to failing the batch outright).
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FacadeError::InvalidConfiguration { .. } | FacadeError::AlreadyProcessed
        )
    }
}

/// Errors that can prevent a writer from starting or completing
/// initialization (the `Created -> Initializing -> InitFailed` path).
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("destination initialization failed: {0}")]
    InitializationFailed(#[source] FacadeError),

    #[error("initialization did not complete before its deadline ({0:?})")]
    InitializationTimedOut(Duration),

    #[error("writer was already started")]
    AlreadyStarted,
}

/// Name-validation error shared by all three facade variants' regex
/// rules, checked before any network call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field} {value:?} does not satisfy {rule}")]
pub struct NameValidationError {
    pub field: &'static str,
    pub value: String,
    pub rule: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_configuration_is_not_retryable() {
        let err = FacadeError::InvalidConfiguration {
            message: "bad group name".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn already_processed_is_not_retryable() {
        assert!(!FacadeError::AlreadyProcessed.is_retryable());
    }

    #[test]
    fn throttling_is_retryable() {
        assert!(FacadeError::Throttling { source: None }.is_retryable());
    }
}
