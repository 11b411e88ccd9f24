//! Error types for store operations.

use thiserror::Error;

/// Errors that can occur against the queue store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Redis connection or command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Consumer group error.
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// Internal error.
    #[error("Internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Check if this is a connection-related error that might be recoverable.
    ///
    /// Callers back off and retry on these; anything else is surfaced.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Redis(e) => {
                let err_str = e.to_string().to_lowercase();
                err_str.contains("connection")
                    || err_str.contains("disconnected")
                    || err_str.contains("broken pipe")
                    || err_str.contains("reset by peer")
                    || err_str.contains("refused")
                    || err_str.contains("eof")
                    || err_str.contains("io error")
                    || err_str.contains("timed out")
            }
            Self::Internal(s) => s.to_lowercase().contains("connection"),
            _ => false,
        }
    }

    /// Check if this is a consumer group missing error (NOGROUP).
    pub fn is_nogroup_error(&self) -> bool {
        match self {
            Self::Redis(e) => e.to_string().contains("NOGROUP"),
            Self::ConsumerGroup(s) => s.contains("NOGROUP"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::ConsumerGroup("NOGROUP no such group".to_string());
        assert!(err.to_string().contains("Consumer group error"));
        assert!(err.is_nogroup_error());
    }

    #[test]
    fn test_is_connection_error() {
        let err = StoreError::Internal("connection refused".to_string());
        assert!(err.is_connection_error());

        let err = StoreError::ConsumerGroup("missing group".to_string());
        assert!(!err.is_connection_error());
    }
}
