//! Error types for the delivery domain.

use thiserror::Error;

/// Result type for delivery operations.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Errors that can occur in the delivery domain.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Request failed validation; the job was never persisted.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Queue store I/O failure.
    #[error("Queue store error: {0}")]
    Store(#[from] queue_store::StoreError),

    /// Template rendering error.
    #[error("Template error: {0}")]
    Template(String),

    /// Provider driver error.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Rate-limit wait exhausted without acquiring a token.
    #[error("Rate limit wait exhausted for provider {0}")]
    RateWaitExhausted(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::Internal(format!("JSON serialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeliveryError::Validation("recipients must not be empty".to_string());
        assert_eq!(
            err.to_string(),
            "Validation error: recipients must not be empty"
        );

        let err = DeliveryError::RateWaitExhausted("smtp".to_string());
        assert!(err.to_string().contains("smtp"));
    }
}
