//! Common error types for Lectern.

use thiserror::Error;

/// Top-level error type for Lectern operations.
///
/// Errors are `Clone` because a single failed fetch is handed to every
/// caller that joined the same in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Transport failure or timeout.
    #[error("Network error: {0}")]
    Network(String),

    /// The backend rejected the request (4xx).
    #[error("Client error ({status}): {message}")]
    Client { status: u16, message: String },

    /// The backend failed to process the request (5xx).
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The response could not be decoded into the expected shape.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build the error for a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if (400..500).contains(&status) {
            Error::Client { status, message }
        } else if status >= 500 {
            Error::Server { status, message }
        } else {
            Error::Network(format!("unexpected status {}: {}", status, message))
        }
    }

    /// Check whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Server { .. })
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Client { status, .. } | Error::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            Error::from_status(404, "missing"),
            Error::Client { status: 404, .. }
        ));
        assert!(matches!(
            Error::from_status(503, "down"),
            Error::Server { status: 503, .. }
        ));
        assert!(matches!(Error::from_status(302, "moved"), Error::Network(_)));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Network("reset".to_string()).is_retryable());
        assert!(Error::from_status(500, "boom").is_retryable());
        assert!(!Error::from_status(422, "invalid").is_retryable());
        assert!(!Error::Parse("eof".to_string()).is_retryable());
    }

    #[test]
    fn test_json_error_is_parse() {
        let err: Error = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert!(matches!(err, Error::Parse(_)));
    }
}
