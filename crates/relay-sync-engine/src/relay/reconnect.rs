// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reconnection logic with exponential backoff

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{EngineError, Result};

/// Reconnection strategy with exponential backoff
#[derive(Debug, Clone)]
pub struct ReconnectionStrategy {
    /// Base backoff in milliseconds
    base_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    max_backoff_ms: u64,

    /// Current attempt number
    current_attempt: u32,

    /// Maximum retry attempts (0 = infinite)
    max_attempts: u32,
}

impl ReconnectionStrategy {
    /// Create a new reconnection strategy
    ///
    /// # Arguments
    /// * `base_backoff_ms` - Initial backoff duration in milliseconds
    /// * `max_attempts` - Maximum retry attempts (0 = infinite)
    pub fn new(base_backoff_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_backoff_ms,
            max_backoff_ms: 60_000, // Cap at 60 seconds
            current_attempt: 0,
            max_attempts,
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff_ms = max_backoff.as_millis() as u64;
        self
    }

    /// Get next backoff duration with exponential increase
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        self.current_attempt += 1;

        // base * 2^(attempt - 1)
        let exp = 2u64.saturating_pow(self.current_attempt - 1);
        let backoff_ms = self.base_backoff_ms.saturating_mul(exp).min(self.max_backoff_ms);

        Some(Duration::from_millis(backoff_ms))
    }

    /// Reset the strategy (after successful connection)
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn attempt_number(&self) -> u32 {
        self.current_attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_attempts > 0 && self.current_attempt >= self.max_attempts
    }
}

/// Execute a retryable async operation with exponential backoff
///
/// Non-retryable errors are returned immediately. Cancelling `cancel` while
/// waiting between attempts returns `EngineError::Closed`.
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    strategy: &mut ReconnectionStrategy,
    operation_name: &str,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        match operation().await {
            Ok(result) => {
                if strategy.attempt_number() > 0 {
                    info!(
                        "[RECONNECT] {} succeeded after {} retries",
                        operation_name,
                        strategy.attempt_number()
                    );
                }
                strategy.reset();
                return Ok(result);
            }
            Err(e) if e.is_retryable() => {
                let Some(backoff) = strategy.next_backoff() else {
                    warn!(
                        "[RECONNECT] {} failed after {} retries - giving up",
                        operation_name,
                        strategy.attempt_number()
                    );
                    return Err(e);
                };
                warn!(
                    "[RECONNECT] {} failed (attempt {}): {} - retrying in {:?}",
                    operation_name,
                    strategy.attempt_number(),
                    e,
                    backoff
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(EngineError::Closed(format!("{} cancelled", operation_name)));
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_backoff() {
        let mut strategy = ReconnectionStrategy::new(100, 4);

        assert_eq!(strategy.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(strategy.next_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(strategy.next_backoff(), Some(Duration::from_millis(400)));
        assert_eq!(strategy.next_backoff(), Some(Duration::from_millis(800)));
        assert_eq!(strategy.next_backoff(), None);
    }

    #[test]
    fn test_backoff_capped() {
        let mut strategy =
            ReconnectionStrategy::new(250, 0).with_max_backoff(Duration::from_secs(1));
        for _ in 0..3 {
            strategy.next_backoff();
        }
        assert_eq!(strategy.next_backoff(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_reset_and_exhaustion() {
        let mut strategy = ReconnectionStrategy::new(100, 2);
        strategy.next_backoff();
        strategy.next_backoff();
        assert!(strategy.is_exhausted());

        strategy.reset();
        assert_eq!(strategy.attempt_number(), 0);
        assert!(!strategy.is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let mut strategy = ReconnectionStrategy::new(10, 3);
        let token = CancellationToken::new();

        let result = retry_with_backoff(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(EngineError::Connection("refused".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            },
            &mut strategy,
            "connect",
            &token,
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(strategy.attempt_number(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let mut strategy = ReconnectionStrategy::new(10, 3);
        let token = CancellationToken::new();

        let result: Result<()> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::Validation("bad".to_string())) }
            },
            &mut strategy,
            "connect",
            &token,
        )
        .await;

        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_when_exhausted() {
        let calls = AtomicU32::new(0);
        let mut strategy = ReconnectionStrategy::new(10, 2);
        let token = CancellationToken::new();

        let result: Result<()> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::Connection("down".to_string())) }
            },
            &mut strategy,
            "connect",
            &token,
        )
        .await;

        assert!(matches!(result, Err(EngineError::Connection(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
