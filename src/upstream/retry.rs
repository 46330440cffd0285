//! Retry with exponential backoff for transient infrastructure failures.
//!
//! This layer only handles network-level trouble and upstream 5xx answers.
//! Throttling is owned by the rate limiter and permanent errors (auth,
//! not-found, validation) are returned on the first attempt.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{ApiErrorCode, UpstreamError};

#[derive(Debug, Clone)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub initial_delay: Duration,
  pub max_delay: Duration,
  pub multiplier: f64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      initial_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(10),
      multiplier: 2.0,
    }
  }
}

/// Exponential backoff with up to 10% jitter, capped at `max_delay`.
///
/// | attempt | base delay                     |
/// |---------|--------------------------------|
/// | 0       | initial                        |
/// | 1       | initial × multiplier           |
/// | 2       | initial × multiplier²          |
pub(crate) fn backoff_delay(
  initial: Duration,
  multiplier: f64,
  max_delay: Duration,
  attempt: u32,
) -> Duration {
  let exponent = attempt.min(30) as i32;
  let base_ms = (initial.as_millis() as f64 * multiplier.max(1.0).powi(exponent))
    .min(max_delay.as_millis() as f64);
  let jitter_ms = if base_ms > 0.0 {
    rand::thread_rng().gen_range(0.0..=base_ms * 0.1)
  } else {
    0.0
  };
  Duration::from_millis((base_ms + jitter_ms) as u64).min(max_delay)
}

/// Retries transient failures of upstream operations.
#[derive(Debug, Clone, Default)]
pub struct RetryHandler {
  config: RetryConfig,
}

impl RetryHandler {
  pub fn new(config: RetryConfig) -> Self {
    Self { config }
  }

  /// Whether `error` is a transient infrastructure failure worth retrying.
  ///
  /// Retryable: every network-layer failure and 5xx answers.
  /// Not retryable: rate limiting, 4xx, GraphQL validation errors, config errors.
  pub fn is_retryable(error: &UpstreamError) -> bool {
    match error {
      UpstreamError::Network { .. } => true,
      UpstreamError::Api {
        code: ApiErrorCode::ServerError,
        ..
      } => true,
      UpstreamError::Api { .. } => error
        .status()
        .is_some_and(|status| (500..600).contains(&status)),
      UpstreamError::RateLimited { .. } | UpstreamError::Config(_) => false,
    }
  }

  /// Run `operation`, retrying transient failures with exponential backoff.
  ///
  /// On exhaustion the original error is returned unchanged.
  pub async fn execute_with_retry<T, F, Fut>(
    &self,
    operation_name: &str,
    mut operation: F,
  ) -> Result<T, UpstreamError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
  {
    let mut attempt = 0u32;

    loop {
      match operation().await {
        Ok(value) => {
          if attempt > 0 {
            info!(
              operation = operation_name,
              retries = attempt,
              "Operation succeeded after transient failures"
            );
          }
          return Ok(value);
        }
        Err(err) if Self::is_retryable(&err) => {
          if attempt >= self.config.max_retries {
            error!(
              operation = operation_name,
              attempts = attempt + 1,
              error = %err,
              "Operation failed, retries exhausted"
            );
            return Err(err);
          }

          let delay = backoff_delay(
            self.config.initial_delay,
            self.config.multiplier,
            self.config.max_delay,
            attempt,
          );
          warn!(
            operation = operation_name,
            attempt = attempt + 1,
            max_retries = self.config.max_retries,
            delay_ms = delay.as_millis() as u64,
            cause = err.code(),
            error = %err,
            "Transient upstream failure, retrying"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(err) => return Err(err),
      }
    }
  }
}
