// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry policies and the transient-error retry wrapper for service calls.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::service::ServiceError;

/// A retry policy, shared between service-call retries and activity retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Option<Duration>,
    /// Zero means unlimited attempts.
    pub maximum_attempts: u32,
    /// Error types that are never retried. Matched against the
    /// application-assigned failure type.
    pub non_retryable_error_types: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Some(Duration::from_secs(10)),
            maximum_attempts: 0,
            non_retryable_error_types: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry `attempt` (1-indexed), or `None` once the policy
    /// is exhausted. `expiration` bounds the schedule: a backoff that would
    /// land past it stops the retries.
    pub fn backoff_for_attempt(
        &self,
        attempt: u32,
        now: Instant,
        expiration: Option<Instant>,
    ) -> Option<Duration> {
        if self.maximum_attempts > 0 && attempt > self.maximum_attempts {
            return None;
        }

        let multiplier = self
            .backoff_coefficient
            .powi(attempt.saturating_sub(1) as i32);
        let mut backoff = self.initial_interval.mul_f64(multiplier.max(0.0));
        if backoff.is_zero() {
            // Overflow or zero initial interval.
            backoff = self.maximum_interval?;
        }
        if let Some(max) = self.maximum_interval {
            if backoff > max {
                backoff = max;
            }
        }

        if let Some(expiration) = expiration {
            if now + backoff > expiration {
                return None;
            }
        }

        Some(backoff)
    }

    /// Returns true if an error of `error_type` may be retried under this
    /// policy.
    pub fn is_retryable(&self, error_type: &str) -> bool {
        !self
            .non_retryable_error_types
            .iter()
            .any(|t| t == error_type)
    }
}

/// Policy applied to every service RPC issued by the worker core.
pub fn service_retry_policy() -> RetryPolicy {
    RetryPolicy {
        initial_interval: Duration::from_millis(20),
        backoff_coefficient: 1.2,
        maximum_interval: Some(Duration::from_secs(6)),
        maximum_attempts: 10,
        non_retryable_error_types: Vec::new(),
    }
}

/// Run `op`, retrying transient service errors per `policy`. Terminal errors
/// and exhausted policies surface the last error.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                let Some(backoff) = policy.backoff_for_attempt(attempt, Instant::now(), None)
                else {
                    return Err(err);
                };
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %err,
                    "Retrying transient service error");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Some(Duration::from_secs(3)),
            maximum_attempts: 0,
            non_retryable_error_types: Vec::new(),
        };
        let now = Instant::now();
        assert_eq!(
            policy.backoff_for_attempt(1, now, None),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            policy.backoff_for_attempt(2, now, None),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            policy.backoff_for_attempt(3, now, None),
            Some(Duration::from_secs(3))
        );
        assert_eq!(
            policy.backoff_for_attempt(9, now, None),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_backoff_stops_at_max_attempts() {
        let policy = RetryPolicy {
            maximum_attempts: 2,
            ..Default::default()
        };
        let now = Instant::now();
        assert!(policy.backoff_for_attempt(2, now, None).is_some());
        assert!(policy.backoff_for_attempt(3, now, None).is_none());
    }

    #[test]
    fn test_backoff_stops_at_expiration() {
        let policy = RetryPolicy::default();
        let now = Instant::now();
        let expiration = now + Duration::from_millis(100);
        assert!(policy.backoff_for_attempt(1, now, Some(expiration)).is_none());
    }

    #[test]
    fn test_non_retryable_error_types() {
        let policy = RetryPolicy {
            non_retryable_error_types: vec!["InvalidInput".to_string()],
            ..Default::default()
        };
        assert!(!policy.is_retryable("InvalidInput"));
        assert!(policy.is_retryable("Timeout"));
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient_errors() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(&service_retry_policy(), || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ServiceError::Unavailable("connection reset".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_surfaces_terminal_errors() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&service_retry_policy(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ServiceError::NotFound("no such workflow".into()))
        })
        .await;
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
