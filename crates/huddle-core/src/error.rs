//! Error types and result aliases for Huddle.
//!
//! Every failure surfaced by the control plane maps onto one stable
//! [`ErrorCode`]. Handlers use the code to decide whether a failure is
//! surfaced to the caller, retried, or recorded and skipped.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// The result type used throughout Huddle.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable, machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Bad input. Never retried.
    Validation,
    /// Caller is not authenticated. Never retried.
    Unauthorized,
    /// Caller is not allowed to perform the action. Never retried.
    Forbidden,
    /// Per-subject rate limit hit. Surfaced with the reset time.
    RateLimitExceeded,
    /// A required state did not hold (e.g. inactive meeting, reused key).
    PreconditionFailed,
    /// An operation did not finish in time.
    Timeout,
    /// A call to an external dependency failed.
    ExternalServiceError,
    /// A stored idempotency result could not be read back.
    StorageReadFailed,
    /// An optimistic-concurrency check failed. Recorded per operation, never raised.
    VersionConflict,
    /// A circuit breaker rejected the call without invoking the dependency.
    CircuitOpen,
    /// Durable storage failed.
    Storage,
    /// Encoding or decoding failed.
    Serialization,
    /// The addressed object does not exist.
    NotFound,
    /// Unexpected internal failure.
    Internal,
}

impl ErrorCode {
    /// Returns the wire representation of the code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
            Self::StorageReadFailed => "STORAGE_READ_FAILED",
            Self::VersionConflict => "VERSION_CONFLICT",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::Storage => "STORAGE",
            Self::Serialization => "SERIALIZATION",
            Self::NotFound => "NOT_FOUND",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in Huddle operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input was provided.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the invalid input.
        message: String,
    },

    /// The caller is not authenticated.
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Description of the failure.
        message: String,
    },

    /// The caller may not perform this action.
    #[error("forbidden: {message}")]
    Forbidden {
        /// Description of the failure.
        message: String,
    },

    /// The subject exhausted its allowance for the current window.
    #[error("rate limit exceeded for {action} by {subject}; retry in {retry_after_secs}s")]
    RateLimitExceeded {
        /// Rate-limited subject (usually a user id).
        subject: String,
        /// Rate-limited action name.
        action: String,
        /// Whole seconds until the window resets (at least 1).
        retry_after_secs: u64,
        /// When the current window ends.
        reset_at: DateTime<Utc>,
    },

    /// A precondition for the operation was not met.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the failed precondition.
        message: String,
    },

    /// The operation did not complete within its deadline.
    #[error("operation '{operation}' timed out after {}ms", after.as_millis())]
    Timeout {
        /// Name of the operation that timed out.
        operation: String,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// An external dependency returned an error.
    #[error("external service '{service}' failed: {message}")]
    ExternalService {
        /// Name of the dependency.
        service: String,
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The dependency's circuit breaker is open.
    #[error("circuit open for '{dependency}'")]
    CircuitOpen {
        /// Name of the guarded dependency.
        dependency: String,
    },

    /// A storage-backed idempotency result exists but could not be read.
    #[error(
        "failed to read stored result for key '{key}' in scope '{scope}' at '{reference}': {message}"
    )]
    StorageReadFailed {
        /// Idempotency key.
        key: String,
        /// Idempotency scope.
        scope: String,
        /// Blob reference recorded on the idempotency record.
        reference: String,
        /// Description of the read failure.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A path or object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a precondition-failed error.
    #[must_use]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an external service error without an underlying cause.
    #[must_use]
    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Creates an external service error wrapping an underlying cause.
    #[must_use]
    pub fn external_with_source(
        service: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a serialization error from any displayable cause.
    #[must_use]
    pub fn serialization(cause: impl fmt::Display) -> Self {
        Self::Serialization {
            message: cause.to_string(),
        }
    }

    /// Returns the stable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { .. } => ErrorCode::Validation,
            Self::Unauthorized { .. } => ErrorCode::Unauthorized,
            Self::Forbidden { .. } => ErrorCode::Forbidden,
            Self::RateLimitExceeded { .. } => ErrorCode::RateLimitExceeded,
            Self::PreconditionFailed { .. } => ErrorCode::PreconditionFailed,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::ExternalService { .. } => ErrorCode::ExternalServiceError,
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Self::StorageReadFailed { .. } => ErrorCode::StorageReadFailed,
            Self::Storage { .. } => ErrorCode::Storage,
            Self::Serialization { .. } => ErrorCode::Serialization,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Internal { .. } => ErrorCode::Internal,
        }
    }

    /// Returns whether the default retry policy may re-attempt after this error.
    ///
    /// Input, authorization, throttling and precondition failures are final.
    /// An open circuit is final for the current call as well.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self.code(),
            ErrorCode::Validation
                | ErrorCode::Unauthorized
                | ErrorCode::Forbidden
                | ErrorCode::RateLimitExceeded
                | ErrorCode::PreconditionFailed
                | ErrorCode::CircuitOpen
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

/// Maps a poisoned lock into an internal error.
pub fn poison_err<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::internal("lock poisoned")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_render_in_screaming_case() {
        assert_eq!(Error::validation("x").code().as_str(), "VALIDATION");
        assert_eq!(
            Error::external("video", "boom").code().to_string(),
            "EXTERNAL_SERVICE_ERROR"
        );
        assert_eq!(ErrorCode::VersionConflict.as_str(), "VERSION_CONFLICT");
    }

    #[test]
    fn auth_and_validation_errors_are_final() {
        assert!(!Error::validation("bad").is_retryable());
        assert!(
            !Error::Forbidden {
                message: "nope".into()
            }
            .is_retryable()
        );
        assert!(
            !Error::Unauthorized {
                message: "who".into()
            }
            .is_retryable()
        );
        assert!(!Error::precondition("inactive").is_retryable());
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(Error::external("video", "503").is_retryable());
        assert!(
            Error::Timeout {
                operation: "create_room".into(),
                after: Duration::from_secs(1),
            }
            .is_retryable()
        );
        assert!(Error::storage("flaky").is_retryable());
    }

    #[test]
    fn storage_read_failure_carries_addressing_context() {
        let err = Error::StorageReadFailed {
            key: "create-meeting-abc123".into(),
            scope: "meetings".into(),
            reference: "idempotency-results/meetings/ab.json".into(),
            message: "unavailable".into(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("create-meeting-abc123"));
        assert!(rendered.contains("meetings"));
        assert!(rendered.contains("idempotency-results/meetings/ab.json"));
        assert_eq!(err.code(), ErrorCode::StorageReadFailed);
    }
}
