//! Typed access to the upstream GraphQL issue tracker.
//!
//! Every call made by [`client::UpstreamClient`] is wrapped by the
//! transient-failure [`retry::RetryHandler`], which in turn wraps the
//! throttling-aware [`rate_limit::RateLimiter`].

pub mod api_types;
pub mod client;
pub mod rate_limit;
pub mod retry;
pub mod types;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::UpstreamError;

pub use client::UpstreamClient;
pub use types::{IssuePage, PageInfo};

/// Source of raw issue records.
#[async_trait]
pub trait IssueSource: Send + Sync {
  /// Fetch one page of a team's issues.
  async fn fetch_issues_page(
    &self,
    team_id: &str,
    first: u32,
    after: Option<&str>,
  ) -> Result<IssuePage, UpstreamError>;

  /// Fetch a single issue. `Ok(None)` means the upstream says it does not exist.
  async fn fetch_issue(&self, id: &str) -> Result<Option<Value>, UpstreamError>;
}
