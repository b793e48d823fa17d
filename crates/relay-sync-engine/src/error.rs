// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error types for the relay-sync engine
//!
//! Fetch APIs never return these to callers; they settle with a
//! [`SettleReason`](crate::fetch::SettleReason) instead. Errors surface only
//! from relay plumbing, slot acquisition and the internals that log them.

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error types for the relay-sync engine
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Empty or degenerate filter
    #[error("Invalid filter: {0}")]
    Validation(String),

    /// Relay could not be reached
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Stopping a subscription or running its cleanup failed
    #[error("Teardown failed: {0}")]
    Teardown(String),

    /// The component was shut down or the subscription stream ended
    #[error("Closed: {0}")]
    Closed(String),

    /// A queued waiter was dropped by the limiter's lossy queue policy
    #[error("Dropped from full limiter queue")]
    QueueOverflow,
}

impl EngineError {
    /// Check if error is retryable (for reconnection logic)
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_errors_are_retried() {
        assert!(EngineError::Connection("refused".to_string()).is_retryable());
        assert!(!EngineError::Validation("empty".to_string()).is_retryable());
        assert!(!EngineError::QueueOverflow.is_retryable());
    }
}
