//! Error taxonomy for upstream calls and sync runs.
//!
//! Every failure that crosses the upstream boundary is classified exactly once
//! into an [`UpstreamError`]. The two retry layers only ever look at the
//! classified value, never at raw transport errors.

use std::error::Error as StdError;
use std::fmt;

/// Kind of network-layer failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
  Timeout,
  DnsFailure,
  NetworkError,
}

impl NetworkKind {
  pub fn code(&self) -> &'static str {
    match self {
      Self::Timeout => "TIMEOUT",
      Self::DnsFailure => "DNS_FAILURE",
      Self::NetworkError => "NETWORK_ERROR",
    }
  }
}

impl fmt::Display for NetworkKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.code())
  }
}

/// Application-level error reported by the upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
  NotFound,
  AuthenticationError,
  PermissionError,
  /// 5xx from the upstream. Transient, retried by the retry handler.
  ServerError,
  GraphqlError,
}

impl ApiErrorCode {
  pub fn code(&self) -> &'static str {
    match self {
      Self::NotFound => "NOT_FOUND",
      Self::AuthenticationError => "AUTHENTICATION_ERROR",
      Self::PermissionError => "PERMISSION_ERROR",
      Self::ServerError => "SERVER_ERROR",
      Self::GraphqlError => "GRAPHQL_ERROR",
    }
  }
}

impl fmt::Display for ApiErrorCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.code())
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
  #[error("configuration error: {0}")]
  Config(String),
  #[error("network error ({kind}): {message}")]
  Network { kind: NetworkKind, message: String },
  #[error("rate limited by upstream: {message}")]
  RateLimited { message: String },
  #[error("upstream API error ({code}): {message}")]
  Api {
    code: ApiErrorCode,
    status: Option<u16>,
    message: String,
  },
}

impl UpstreamError {
  pub fn network(kind: NetworkKind, message: impl Into<String>) -> Self {
    Self::Network {
      kind,
      message: message.into(),
    }
  }

  pub fn api(code: ApiErrorCode, status: Option<u16>, message: impl Into<String>) -> Self {
    Self::Api {
      code,
      status,
      message: message.into(),
    }
  }

  /// Stable code recorded in the sync status and run-log.
  pub fn code(&self) -> &'static str {
    match self {
      Self::Config(_) => "CONFIG_ERROR",
      Self::Network { kind, .. } => kind.code(),
      Self::RateLimited { .. } => "RATE_LIMITED",
      Self::Api { code, .. } => code.code(),
    }
  }

  pub fn is_not_found(&self) -> bool {
    matches!(
      self,
      Self::Api {
        code: ApiErrorCode::NotFound,
        ..
      }
    )
  }

  /// HTTP status the upstream answered with, when there was one.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Api { status, .. } => *status,
      _ => None,
    }
  }
}

/// Errors that end a sync run.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SyncError {
  #[error("sync is not configured: {0}")]
  Config(String),
  #[error("all {failed} fetched issues failed to transform")]
  TransformFailed { failed: usize },
  #[error(transparent)]
  Upstream(#[from] UpstreamError),
  #[error("sync run aborted: {0}")]
  Internal(String),
}

impl SyncError {
  pub fn code(&self) -> &'static str {
    match self {
      Self::Config(_) => "SYNC_CONFIG_ERROR",
      Self::TransformFailed { .. } => "TRANSFORM_FAILED",
      Self::Upstream(e) => e.code(),
      Self::Internal(_) => "SYNC_INTERNAL_ERROR",
    }
  }
}

// ============================================================================
// Classification
// ============================================================================

/// Classify a transport-level failure from reqwest.
///
/// Network-layer signals take precedence over everything else; a status
/// carried by the error is used next, then the message text.
pub fn classify_transport(err: &reqwest::Error) -> UpstreamError {
  let message = error_chain(err);

  if err.is_timeout() {
    return UpstreamError::network(NetworkKind::Timeout, message);
  }
  if err.is_connect() {
    let kind = if looks_like_dns(&message) {
      NetworkKind::DnsFailure
    } else {
      NetworkKind::NetworkError
    };
    return UpstreamError::network(kind, message);
  }
  if let Some(status) = err.status() {
    if let Some(classified) = classify_status(status.as_u16(), &message) {
      return classified;
    }
  }
  if err.is_request() || err.is_body() {
    return UpstreamError::network(NetworkKind::NetworkError, message);
  }
  if err.is_decode() {
    return UpstreamError::api(ApiErrorCode::GraphqlError, None, message);
  }

  classify_message(&message)
    .unwrap_or_else(|| UpstreamError::network(NetworkKind::NetworkError, message))
}

/// Classify a non-success HTTP response or a GraphQL error payload.
///
/// Order: decisive HTTP status, then the structured `extensions.code` of the
/// first GraphQL error, then message substrings. A body that cannot be parsed
/// contributes nothing rather than failing the classification.
pub fn classify_response(status: u16, body: &str) -> UpstreamError {
  let parsed = parse_graphql_errors(body);
  let message = parsed
    .as_ref()
    .and_then(|errors| errors.first().map(|e| e.message.clone()))
    .unwrap_or_else(|| truncate(body, 300));

  if let Some(classified) = classify_status(status, &message) {
    return classified;
  }

  if let Some(errors) = &parsed {
    let structured = errors.iter().find_map(|error| {
      error
        .code
        .as_deref()
        .and_then(|code| classify_extension_code(code, &error.message))
    });
    if let Some(classified) = structured {
      return classified;
    }
  }

  let status = (status != 200).then_some(status);
  classify_message(&message)
    .unwrap_or_else(|| UpstreamError::api(ApiErrorCode::GraphqlError, status, message))
}

fn classify_status(status: u16, message: &str) -> Option<UpstreamError> {
  let code = match status {
    401 => ApiErrorCode::AuthenticationError,
    403 => ApiErrorCode::PermissionError,
    404 => ApiErrorCode::NotFound,
    429 => {
      return Some(UpstreamError::RateLimited {
        message: message.to_string(),
      })
    }
    500..=599 => ApiErrorCode::ServerError,
    _ => return None,
  };
  Some(UpstreamError::api(code, Some(status), message))
}

fn classify_extension_code(code: &str, message: &str) -> Option<UpstreamError> {
  let classified = match code.to_ascii_uppercase().as_str() {
    "RATELIMITED" | "RATE_LIMITED" => UpstreamError::RateLimited {
      message: message.to_string(),
    },
    "AUTHENTICATION_ERROR" | "UNAUTHENTICATED" => {
      UpstreamError::api(ApiErrorCode::AuthenticationError, None, message)
    }
    "FORBIDDEN" | "PERMISSION_ERROR" => {
      UpstreamError::api(ApiErrorCode::PermissionError, None, message)
    }
    "ENTITY_NOT_FOUND" | "NOT_FOUND" => UpstreamError::api(ApiErrorCode::NotFound, None, message),
    "INTERNAL_SERVER_ERROR" => UpstreamError::api(ApiErrorCode::ServerError, None, message),
    _ => return None,
  };
  Some(classified)
}

/// Last-resort classification from message text.
pub fn classify_message(message: &str) -> Option<UpstreamError> {
  let lower = message.to_lowercase();
  let contains_any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

  if contains_any(&["ratelimited", "rate limit", "rate-limit", "too many requests"]) {
    return Some(UpstreamError::RateLimited {
      message: message.to_string(),
    });
  }
  if contains_any(&["timed out", "timeout", "etimedout"]) {
    return Some(UpstreamError::network(NetworkKind::Timeout, message));
  }
  if looks_like_dns(&lower) {
    return Some(UpstreamError::network(NetworkKind::DnsFailure, message));
  }
  if contains_any(&[
    "econnrefused",
    "econnreset",
    "connection refused",
    "connection reset",
    "fetch failed",
    "broken pipe",
  ]) {
    return Some(UpstreamError::network(NetworkKind::NetworkError, message));
  }
  if contains_any(&["not found", "entity not found"]) {
    return Some(UpstreamError::api(ApiErrorCode::NotFound, None, message));
  }
  if contains_any(&["authentication", "unauthorized", "invalid api key"]) {
    return Some(UpstreamError::api(ApiErrorCode::AuthenticationError, None, message));
  }
  if contains_any(&["forbidden", "permission"]) {
    return Some(UpstreamError::api(ApiErrorCode::PermissionError, None, message));
  }
  None
}

fn looks_like_dns(message: &str) -> bool {
  let lower = message.to_lowercase();
  ["dns", "failed to lookup address", "enotfound", "name or service not known", "no such host"]
    .iter()
    .any(|n| lower.contains(n))
}

struct GraphqlErrorInfo {
  message: String,
  code: Option<String>,
}

fn parse_graphql_errors(body: &str) -> Option<Vec<GraphqlErrorInfo>> {
  let value: serde_json::Value = serde_json::from_str(body).ok()?;
  let errors = value.get("errors")?.as_array()?;
  let parsed: Vec<GraphqlErrorInfo> = errors
    .iter()
    .map(|e| GraphqlErrorInfo {
      message: e
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string(),
      code: e
        .pointer("/extensions/code")
        .and_then(|c| c.as_str())
        .map(String::from),
    })
    .collect();
  (!parsed.is_empty()).then_some(parsed)
}

/// Flatten an error and its sources into one line.
fn error_chain(err: &dyn StdError) -> String {
  let mut message = err.to_string();
  let mut source = err.source();
  while let Some(inner) = source {
    message.push_str(": ");
    message.push_str(&inner.to_string());
    source = inner.source();
  }
  message
}

// ============================================================================
// Scrubbing
// ============================================================================

const MAX_MESSAGE_LEN: usize = 500;

/// Strip credential-shaped tokens from a message before it is stored or shown.
pub fn scrub_message(message: &str) -> String {
  let mut redact_next = false;
  let words: Vec<String> = message
    .split(' ')
    .map(|word| {
      if redact_next && !word.is_empty() {
        redact_next = false;
        return "[redacted]".to_string();
      }
      let lower = word.to_lowercase();
      if lower == "bearer" || lower.starts_with("authorization") {
        redact_next = !lower.contains('=');
        if lower.contains('=') {
          return "authorization=[redacted]".to_string();
        }
        return word.to_string();
      }
      if lower.starts_with("lin_api_") || lower.starts_with("lin_oauth_") {
        return "[redacted]".to_string();
      }
      word.to_string()
    })
    .collect();

  truncate(&words.join(" "), MAX_MESSAGE_LEN)
}

fn truncate(s: &str, max_chars: usize) -> String {
  if s.chars().count() <= max_chars {
    return s.to_string();
  }
  let mut out: String = s.chars().take(max_chars).collect();
  out.push('…');
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_takes_precedence_over_message() {
    let body = r#"{"errors":[{"message":"rate limit exceeded"}]}"#;
    let err = classify_response(401, body);
    assert_eq!(err.code(), "AUTHENTICATION_ERROR");
  }

  #[test]
  fn extension_code_detects_throttling_without_429() {
    let body = r#"{"errors":[{"message":"Too complex","extensions":{"code":"RATELIMITED"}}]}"#;
    let err = classify_response(400, body);
    assert!(matches!(err, UpstreamError::RateLimited { .. }));
  }

  #[test]
  fn server_errors_carry_status() {
    let err = classify_response(503, "upstream unavailable");
    assert_eq!(
      err,
      UpstreamError::api(ApiErrorCode::ServerError, Some(503), "upstream unavailable")
    );
  }

  #[test]
  fn unparseable_body_falls_back_to_generic_graphql_error() {
    let err = classify_response(400, "<html>bad gateway</html>");
    assert_eq!(err.code(), "GRAPHQL_ERROR");
    assert_eq!(err.status(), Some(400));
  }

  #[test]
  fn not_found_message_is_recognised() {
    let body = r#"{"errors":[{"message":"Entity not found: Issue"}]}"#;
    assert!(classify_response(200, body).is_not_found());
  }

  #[test]
  fn message_fallback_recognises_network_failures() {
    assert_eq!(
      classify_message("getaddrinfo ENOTFOUND api.example.com").map(|e| e.code()),
      Some("DNS_FAILURE")
    );
    assert_eq!(
      classify_message("read ECONNRESET").map(|e| e.code()),
      Some("NETWORK_ERROR")
    );
    assert_eq!(classify_message("something else entirely"), None);
  }

  #[test]
  fn sync_error_codes() {
    assert_eq!(SyncError::Config("x".into()).code(), "SYNC_CONFIG_ERROR");
    assert_eq!(SyncError::TransformFailed { failed: 3 }.code(), "TRANSFORM_FAILED");
    let upstream = UpstreamError::network(NetworkKind::Timeout, "slow");
    assert_eq!(SyncError::from(upstream).code(), "TIMEOUT");
  }

  #[test]
  fn scrub_removes_credentials() {
    let scrubbed = scrub_message("request failed with Bearer abc123 and key lin_api_SECRET");
    assert!(!scrubbed.contains("abc123"));
    assert!(!scrubbed.contains("SECRET"));
    assert!(scrubbed.contains("request failed"));
  }

  #[test]
  fn scrub_truncates_long_messages() {
    let long = "x".repeat(2000);
    assert!(scrub_message(&long).chars().count() <= MAX_MESSAGE_LEN + 1);
  }
}
