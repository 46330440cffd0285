use async_trait::async_trait;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use super::api_types::{
  issue_query, team_issues_query, ApiIssueData, ApiTeamIssuesData, GraphqlRequest, GraphqlResponse,
  RATE_LIMIT_REFRESH_QUERY,
};
use super::rate_limit::RateLimiter;
use super::retry::RetryHandler;
use super::types::IssuePage;
use super::IssueSource;
use crate::config::{Config, RefreshMode, UpstreamConfig};
use crate::error::{classify_response, classify_transport, ApiErrorCode, UpstreamError};

/// GraphQL client for the upstream issue tracker.
///
/// Cheap to clone; clones share the HTTP connection pool and rate limiter.
#[derive(Clone)]
pub struct UpstreamClient {
  http: reqwest::Client,
  endpoint: String,
  api_key: String,
  refresh_mode: RefreshMode,
  rate_limiter: Arc<RateLimiter>,
  retry: RetryHandler,
}

impl UpstreamClient {
  /// Create a client from configuration. Fails fast when the API key is absent.
  pub fn new(config: &Config, rate_limiter: Arc<RateLimiter>) -> Result<Self, UpstreamError> {
    let api_key = Config::get_api_key().ok_or_else(|| {
      UpstreamError::Config(
        "Upstream API key not found. Set ISSUESYNC_API_KEY or LINEAR_API_KEY environment variable."
          .to_string(),
      )
    })?;

    Self::with_api_key(
      &config.upstream,
      api_key,
      RetryHandler::new((&config.retry).into()),
      rate_limiter,
    )
  }

  pub fn with_api_key(
    upstream: &UpstreamConfig,
    api_key: String,
    retry: RetryHandler,
    rate_limiter: Arc<RateLimiter>,
  ) -> Result<Self, UpstreamError> {
    if api_key.trim().is_empty() {
      return Err(UpstreamError::Config("Upstream API key is empty".to_string()));
    }

    let http = reqwest::Client::builder()
      .timeout(upstream.timeout())
      .user_agent(concat!("issuesync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| UpstreamError::Config(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self {
      http,
      endpoint: upstream.url.clone(),
      api_key,
      refresh_mode: upstream.refresh_rate_limits,
      rate_limiter,
      retry,
    })
  }

  pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
    &self.rate_limiter
  }

  /// Run a query through both retry layers.
  ///
  /// Transient network failures are retried by the retry handler; throttling
  /// is retried by the rate limiter, which also throttles before each attempt.
  async fn execute<T: DeserializeOwned>(
    &self,
    operation: &str,
    query: &str,
    variables: Value,
  ) -> Result<T, UpstreamError> {
    let variables = &variables;
    self
      .retry
      .execute_with_retry(operation, || {
        self
          .rate_limiter
          .execute_with_retry(move || self.send::<T>(operation, query, variables))
      })
      .await
  }

  /// One HTTP round trip, classified.
  async fn send<T: DeserializeOwned>(
    &self,
    operation: &str,
    query: &str,
    variables: &Value,
  ) -> Result<T, UpstreamError> {
    debug!(operation, "Sending upstream query");

    let response = self
      .http
      .post(&self.endpoint)
      .header(AUTHORIZATION, &self.api_key)
      .json(&GraphqlRequest { query, variables })
      .send()
      .await
      .map_err(|e| classify_transport(&e))?;

    let status = response.status();
    let had_headers = self
      .rate_limiter
      .update_from_headers(response.headers())
      .is_some();
    let body = response.text().await.map_err(|e| classify_transport(&e));

    let should_refresh = match self.refresh_mode {
      RefreshMode::Always => true,
      RefreshMode::WhenMissing => !had_headers,
      RefreshMode::Never => false,
    };
    if should_refresh {
      self.refresh_rate_limits().await;
    }

    decode(status, &body?)
  }

  /// Lightweight follow-up request whose only purpose is to refresh the
  /// rate-limit snapshot. Never fails the caller.
  async fn refresh_rate_limits(&self) {
    let result = self
      .http
      .post(&self.endpoint)
      .header(AUTHORIZATION, &self.api_key)
      .json(&json!({ "query": RATE_LIMIT_REFRESH_QUERY }))
      .send()
      .await;

    match result {
      Ok(response) => {
        let headers: &HeaderMap = response.headers();
        if self.rate_limiter.update_from_headers(headers).is_none() {
          debug!(status = %response.status(), "Rate-limit refresh returned no rate-limit headers");
        }
      }
      Err(e) => debug!(error = %e, "Rate-limit refresh failed"),
    }
  }

  /// Fetch one page of a team's issues.
  pub async fn list_issues(
    &self,
    team_id: &str,
    first: u32,
    after: Option<&str>,
  ) -> Result<IssuePage, UpstreamError> {
    let query = team_issues_query();
    let data: ApiTeamIssuesData = self
      .execute(
        "list_issues",
        &query,
        json!({ "teamId": team_id, "first": first, "after": after }),
      )
      .await?;

    let team = data.team.ok_or_else(|| {
      UpstreamError::api(
        ApiErrorCode::NotFound,
        None,
        format!("Team {} not found", team_id),
      )
    })?;

    Ok(IssuePage {
      nodes: team.issues.nodes,
      page_info: team.issues.page_info,
    })
  }

  /// Get a single issue by id or identifier.
  ///
  /// Returns `Ok(None)` when the upstream reports the issue absent.
  pub async fn get_issue_by_id(&self, id: &str) -> Result<Option<Value>, UpstreamError> {
    let query = issue_query();
    let result: Result<ApiIssueData, _> = self
      .execute("get_issue", &query, json!({ "id": id }))
      .await;

    match result {
      Ok(data) => Ok(data.issue),
      Err(e) if e.is_not_found() => Ok(None),
      Err(e) => Err(e),
    }
  }
}

/// Turn a raw HTTP answer into typed data or a classified error.
fn decode<T: DeserializeOwned>(status: StatusCode, body: &str) -> Result<T, UpstreamError> {
  if !status.is_success() {
    return Err(classify_response(status.as_u16(), body));
  }

  let envelope: GraphqlResponse = serde_json::from_str(body).map_err(|e| {
    UpstreamError::api(
      ApiErrorCode::GraphqlError,
      Some(status.as_u16()),
      format!("Invalid response body: {}", e),
    )
  })?;

  if !envelope.errors.is_empty() {
    return Err(classify_response(status.as_u16(), body));
  }

  let data = envelope.data.ok_or_else(|| {
    UpstreamError::api(
      ApiErrorCode::GraphqlError,
      Some(status.as_u16()),
      "Response carried no data",
    )
  })?;

  serde_json::from_value(data).map_err(|e| {
    UpstreamError::api(
      ApiErrorCode::GraphqlError,
      Some(status.as_u16()),
      format!("Unexpected response shape: {}", e),
    )
  })
}

#[async_trait]
impl IssueSource for UpstreamClient {
  async fn fetch_issues_page(
    &self,
    team_id: &str,
    first: u32,
    after: Option<&str>,
  ) -> Result<IssuePage, UpstreamError> {
    self.list_issues(team_id, first, after).await
  }

  async fn fetch_issue(&self, id: &str) -> Result<Option<Value>, UpstreamError> {
    self.get_issue_by_id(id).await
  }
}
