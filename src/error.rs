//! Custom error types for reqflow

use thiserror::Error;

/// Main error type for reqflow operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Malformed response from extraction service: {0}")]
    MalformedResponse(String),

    #[error("Extraction service unavailable: {0}")]
    TransientService(String),

    #[error("Extraction service rejected request ({status}): {body}")]
    ServiceRejected { status: u16, body: String },

    #[error("Conflict job {job_id} unresolved after {attempts} attempts: {last_error}")]
    PollExhausted {
        job_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Not initialized: run 'reqflow init' first")]
    NotInitialized,

    #[error("{0}")]
    Other(String),
}

/// How a failure should be treated by the job scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input or missing resource; the resource goes straight to `failed`
    Validation,
    /// The service answered with something we could not parse
    MalformedResponse,
    /// Network failure, timeout or 5xx; retried under the job's policy
    Transient,
    /// Poll budget used up; terminal for the poll job only
    PollExhaustion,
    /// Everything else; not retried
    Fatal,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Validation(_) | Error::NotFound(_) => ErrorClass::Validation,
            Error::MalformedResponse(_) => ErrorClass::MalformedResponse,
            Error::TransientService(_) | Error::Http(_) => ErrorClass::Transient,
            // A locked or busy SQLite file clears up on its own
            Error::Database(sqlx::Error::PoolTimedOut) => ErrorClass::Transient,
            Error::PollExhausted { .. } => ErrorClass::PollExhaustion,
            _ => ErrorClass::Fatal,
        }
    }

    /// Whether the scheduler may run the job again
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Result type alias for reqflow
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(Error::TransientService("connection reset".to_string()).is_retryable());
        assert!(!Error::MalformedResponse("expected value".to_string()).is_retryable());
        assert!(!Error::Validation("empty content".to_string()).is_retryable());
        assert!(!Error::ServiceRejected {
            status: 422,
            body: "bad".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_not_found_is_validation_class() {
        assert_eq!(
            Error::NotFound("project 7".to_string()).class(),
            ErrorClass::Validation
        );
    }
}
