//! Header-driven rate limiting for the upstream GraphQL API.
//!
//! The upstream reports three independent budgets on every response:
//! a global request budget, a computational complexity budget and a
//! per-endpoint budget. [`RateLimiter`] keeps the latest snapshot of all
//! three, throttles before each call when a budget is close to empty, and
//! retries calls the upstream rejected as throttled.
//!
//! The snapshot is immutable and swapped as a whole on every update, so
//! readers always see a consistent view without holding a lock across a
//! computation.

use chrono::Utc;
use reqwest::header::HeaderMap;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Level};

use super::retry::backoff_delay;
use crate::error::{classify_message, UpstreamError};

const REQUESTS_PREFIX: &str = "x-ratelimit-requests";
const COMPLEXITY_PREFIX: &str = "x-ratelimit-complexity";
const ENDPOINT_PREFIX: &str = "x-ratelimit-endpoint-requests";
const ENDPOINT_NAME: &str = "x-ratelimit-endpoint-name";
const LAST_COMPLEXITY: &str = "x-complexity";

/// Remaining fraction below which the budget is logged as critical
const CRITICAL_BUDGET_RATIO: f64 = 0.1;
/// Remaining fraction below which the budget is logged as running low
const LOW_BUDGET_RATIO: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
  pub max_retries: u32,
  pub initial_delay: Duration,
  pub max_delay: Duration,
  pub multiplier: f64,
  /// Fraction of each bucket that must be available before a call goes out
  pub safety_threshold: f64,
  /// Window over which a full bucket refills
  pub window: Duration,
}

impl Default for RateLimitConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      initial_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(60),
      multiplier: 2.0,
      safety_threshold: 0.1,
      window: Duration::from_secs(3600),
    }
  }
}

/// One budget as last reported by the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
  pub limit: u64,
  pub remaining: u64,
  /// Epoch milliseconds at which the upstream resets the bucket
  pub reset: i64,
}

impl Bucket {
  fn ratio(&self) -> f64 {
    if self.limit == 0 {
      return 1.0;
    }
    self.remaining as f64 / self.limit as f64
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplexityBucket {
  #[serde(flatten)]
  pub bucket: Bucket,
  /// Complexity cost of the call that produced this snapshot
  pub last_cost: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointBucket {
  #[serde(flatten)]
  pub bucket: Bucket,
  pub name: Option<String>,
}

/// Snapshot of every budget the upstream reported on its last response.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitState {
  pub requests: Option<Bucket>,
  pub complexity: Option<ComplexityBucket>,
  pub endpoint: Option<EndpointBucket>,
  /// Milliseconds since epoch when the headers were read
  pub updated_at: Option<i64>,
  #[serde(skip)]
  pub observed_at: Option<Instant>,
}

impl RateLimitState {
  fn buckets(&self) -> impl Iterator<Item = (&'static str, &Bucket)> {
    [
      self.requests.as_ref().map(|b| ("requests", b)),
      self.complexity.as_ref().map(|c| ("complexity", &c.bucket)),
      self.endpoint.as_ref().map(|e| ("endpoint", &e.bucket)),
    ]
    .into_iter()
    .flatten()
  }
}

/// Parse rate-limit headers into a fresh snapshot.
///
/// A dimension missing any of its three headers is `None`; the others are
/// unaffected. Returns `None` when the response carried no rate-limit headers
/// at all.
pub fn parse_headers(headers: &HeaderMap) -> Option<RateLimitState> {
  let requests = parse_bucket(headers, REQUESTS_PREFIX);
  let complexity = parse_bucket(headers, COMPLEXITY_PREFIX).map(|bucket| ComplexityBucket {
    bucket,
    last_cost: header_u64(headers, LAST_COMPLEXITY),
  });
  let endpoint = parse_bucket(headers, ENDPOINT_PREFIX).map(|bucket| EndpointBucket {
    bucket,
    name: header_str(headers, ENDPOINT_NAME).map(String::from),
  });

  let any_header = headers
    .keys()
    .any(|name| name.as_str().starts_with("x-ratelimit-") || name.as_str() == LAST_COMPLEXITY);
  if !any_header {
    return None;
  }

  Some(RateLimitState {
    requests,
    complexity,
    endpoint,
    updated_at: Some(Utc::now().timestamp_millis()),
    observed_at: Some(Instant::now()),
  })
}

fn parse_bucket(headers: &HeaderMap, prefix: &str) -> Option<Bucket> {
  Some(Bucket {
    limit: header_u64(headers, &format!("{}-limit", prefix))?,
    remaining: header_u64(headers, &format!("{}-remaining", prefix))?,
    reset: header_str(headers, &format!("{}-reset", prefix))?
      .trim()
      .parse()
      .ok()?,
  })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
  headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
  header_str(headers, name).and_then(|v| v.trim().parse().ok())
}

/// Time to wait before the next call so every bucket stays above the safety
/// threshold.
///
/// Refill is estimated with a leaky-bucket model: a bucket regains
/// `limit / window` tokens per second since the headers were observed,
/// capped at `limit`. The longest wait across dimensions wins.
pub fn required_wait(state: &RateLimitState, config: &RateLimitConfig, now: Instant) -> Duration {
  let elapsed = state
    .observed_at
    .map(|at| now.saturating_duration_since(at).as_secs_f64())
    .unwrap_or(0.0);
  let window = config.window.as_secs_f64().max(1.0);

  let wait_ms = state
    .buckets()
    .filter(|(_, bucket)| bucket.limit > 0)
    .map(|(_, bucket)| {
      let limit = bucket.limit as f64;
      let refill_per_sec = limit / window;
      let threshold = limit * config.safety_threshold;
      let estimated = (bucket.remaining as f64 + elapsed * refill_per_sec).min(limit);
      if estimated >= threshold {
        0.0
      } else {
        ((threshold - estimated) / refill_per_sec * 1000.0).ceil()
      }
    })
    .fold(0.0_f64, f64::max);

  Duration::from_millis(wait_ms as u64)
}

/// Rate limiter shared by every upstream call.
pub struct RateLimiter {
  config: RateLimitConfig,
  state: RwLock<Arc<RateLimitState>>,
}

impl RateLimiter {
  pub fn new(config: RateLimitConfig) -> Self {
    Self {
      config,
      state: RwLock::new(Arc::new(RateLimitState::default())),
    }
  }

  /// Current snapshot.
  pub fn state(&self) -> Arc<RateLimitState> {
    match self.state.read() {
      Ok(guard) => Arc::clone(&guard),
      Err(poisoned) => Arc::clone(&poisoned.into_inner()),
    }
  }

  fn replace_state(&self, next: RateLimitState) -> Arc<RateLimitState> {
    let next = Arc::new(next);
    match self.state.write() {
      Ok(mut guard) => *guard = Arc::clone(&next),
      Err(poisoned) => *poisoned.into_inner() = Arc::clone(&next),
    }
    next
  }

  /// Replace the snapshot from response headers.
  ///
  /// Returns the new snapshot, or `None` when the response had no rate-limit
  /// headers (the previous snapshot is kept).
  pub fn update_from_headers(&self, headers: &HeaderMap) -> Option<Arc<RateLimitState>> {
    let parsed = parse_headers(headers)?;
    log_budget(&parsed);
    Some(self.replace_state(parsed))
  }

  /// Sleep until every known bucket is estimated to be above the safety threshold.
  pub async fn wait_if_needed(&self) {
    let state = self.state();
    let wait = required_wait(&state, &self.config, Instant::now());
    if wait.is_zero() {
      return;
    }

    warn!(
      wait_ms = wait.as_millis() as u64,
      "Rate-limit budget low, throttling before next upstream call"
    );
    tokio::time::sleep(wait).await;
  }

  /// Whether an error is the upstream's throttling signal.
  pub fn is_rate_limited(error: &UpstreamError) -> bool {
    match error {
      UpstreamError::RateLimited { .. } => true,
      UpstreamError::Api { message, .. } => matches!(
        classify_message(message),
        Some(UpstreamError::RateLimited { .. })
      ),
      _ => false,
    }
  }

  /// Run `operation`, throttling before each attempt and retrying when the
  /// upstream reports throttling.
  ///
  /// Any other error is returned immediately. After `max_retries` throttled
  /// retries the last error is returned unchanged.
  pub async fn execute_with_retry<T, F, Fut>(&self, mut operation: F) -> Result<T, UpstreamError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
  {
    let mut attempt = 0u32;

    loop {
      self.wait_if_needed().await;

      match operation().await {
        Ok(value) => {
          if attempt > 0 {
            info!(retries = attempt, "Upstream call succeeded after rate-limit retries");
          }
          return Ok(value);
        }
        Err(err) if Self::is_rate_limited(&err) => {
          if attempt >= self.config.max_retries {
            error!(
              attempts = attempt + 1,
              error = %err,
              "Rate-limit retries exhausted"
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
            attempt = attempt + 1,
            max_retries = self.config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Upstream rate limited the request, backing off"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(err) => return Err(err),
      }
    }
  }
}

fn log_budget(state: &RateLimitState) {
  let Some((dimension, bucket)) = state
    .buckets()
    .min_by(|(_, a), (_, b)| a.ratio().total_cmp(&b.ratio()))
  else {
    debug!("Rate-limit headers present but no complete dimension");
    return;
  };

  let ratio = bucket.ratio();
  let percent = (ratio * 100.0).round() as u64;
  let level = budget_level(ratio);
  if level == Level::ERROR {
    error!(
      dimension,
      remaining = bucket.remaining,
      limit = bucket.limit,
      percent,
      "Upstream rate-limit budget critically low"
    );
  } else if level == Level::WARN {
    warn!(
      dimension,
      remaining = bucket.remaining,
      limit = bucket.limit,
      percent,
      "Upstream rate-limit budget running low"
    );
  } else {
    info!(
      dimension,
      remaining = bucket.remaining,
      limit = bucket.limit,
      percent,
      "Upstream rate-limit budget"
    );
  }
}

/// Log level for a bucket with `ratio` of its limit remaining.
fn budget_level(ratio: f64) -> Level {
  if ratio < CRITICAL_BUDGET_RATIO {
    Level::ERROR
  } else if ratio < LOW_BUDGET_RATIO {
    Level::WARN
  } else {
    Level::INFO
  }
}
