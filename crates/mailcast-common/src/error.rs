//! Error types for Mailcast

use thiserror::Error;

/// Main error type for Mailcast
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Bad campaign configuration, rejected before any state transition
    #[error("Validation error: {0}")]
    Validation(String),

    /// The audience resolved to zero recipients
    #[error("Invalid audience: {0}")]
    InvalidAudience(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Transport error: {message}")]
    Transport { retryable: bool, message: String },

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Signature verification failed: {0}")]
    Signature(String),

    /// Unexpected internal fault while running a campaign
    #[error("Orchestration error: {0}")]
    Orchestration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Mailcast
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Config(_) => 500,
            Error::Database(_) => 500,
            Error::Validation(_) => 422,
            Error::InvalidAudience(_) => 422,
            Error::InvalidTransition { .. } => 409,
            Error::Transport { .. } => 502,
            Error::TemplateNotFound(_) => 404,
            Error::MalformedPayload(_) => 400,
            Error::Signature(_) => 401,
            Error::Orchestration(_) => 500,
            Error::NotFound(_) => 404,
            Error::Internal(_) => 500,
            Error::Other(_) => 500,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::InvalidAudience(_) => "INVALID_AUDIENCE",
            Error::InvalidTransition { .. } => "INVALID_TRANSITION",
            Error::Transport { .. } => "TRANSPORT_ERROR",
            Error::TemplateNotFound(_) => "TEMPLATE_NOT_FOUND",
            Error::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            Error::Signature(_) => "INVALID_SIGNATURE",
            Error::Orchestration(_) => "ORCHESTRATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether a retry of the failed operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { retryable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::Validation("x".into()).status_code(), 422);
        assert_eq!(Error::Signature("bad".into()).status_code(), 401);
        assert_eq!(
            Error::InvalidTransition {
                from: "sent".into(),
                to: "sending".into()
            }
            .status_code(),
            409
        );
    }

    #[test]
    fn test_retryable() {
        let retryable = Error::Transport {
            retryable: true,
            message: "421 try again".into(),
        };
        let fatal = Error::Transport {
            retryable: false,
            message: "550 no such user".into(),
        };
        assert!(retryable.is_retryable());
        assert!(!fatal.is_retryable());
        assert!(!Error::Internal("boom".into()).is_retryable());
    }
}
