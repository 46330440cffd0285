//! Serde types matching the upstream GraphQL API.
//!
//! Issue nodes are kept as raw JSON until the sync transform step so that one
//! malformed record cannot fail the decode of a whole page.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::PageInfo;

// ============================================================================
// Queries
// ============================================================================

const ISSUE_FIELDS: &str = r#"
  id
  identifier
  title
  description
  priority
  priorityLabel
  url
  sortOrder
  createdAt
  updatedAt
  completedAt
  canceledAt
  state { name type color }
  assignee { id name displayName }
  labels { nodes { name } }
"#;

pub fn team_issues_query() -> String {
  format!(
    r#"query TeamIssues($teamId: String!, $first: Int!, $after: String) {{
  team(id: $teamId) {{
    issues(first: $first, after: $after) {{
      nodes {{ {fields} }}
      pageInfo {{ hasNextPage endCursor }}
    }}
  }}
}}"#,
    fields = ISSUE_FIELDS
  )
}

pub fn issue_query() -> String {
  format!(
    r#"query IssueById($id: String!) {{
  issue(id: $id) {{ {fields} }}
}}"#,
    fields = ISSUE_FIELDS
  )
}

/// Cheapest possible query; only sent to read rate-limit headers.
pub const RATE_LIMIT_REFRESH_QUERY: &str = "query RateLimitRefresh { viewer { id } }";

// ============================================================================
// Envelope
// ============================================================================

#[derive(Debug, Serialize)]
pub struct GraphqlRequest<'a> {
  pub query: &'a str,
  pub variables: &'a Value,
}

#[derive(Debug, Deserialize)]
pub struct GraphqlResponse {
  pub data: Option<Value>,
  #[serde(default)]
  pub errors: Vec<Value>,
}

// ============================================================================
// Team issues response
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiTeamIssuesData {
  pub team: Option<ApiTeam>,
}

#[derive(Debug, Deserialize)]
pub struct ApiTeam {
  pub issues: ApiIssueConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiIssueConnection {
  #[serde(default)]
  pub nodes: Vec<Value>,
  pub page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
pub struct ApiIssueData {
  pub issue: Option<Value>,
}

// ============================================================================
// Issue node
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiState {
  pub name: String,
  #[serde(rename = "type", default)]
  pub state_type: String,
  pub color: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiUser {
  pub id: String,
  pub name: Option<String>,
  pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiLabel {
  pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiLabelConnection {
  #[serde(default)]
  pub nodes: Vec<ApiLabel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiIssue {
  pub id: String,
  pub identifier: String,
  pub title: String,
  pub description: Option<String>,
  /// 0 = none, 1 = urgent, 2 = high, 3 = medium, 4 = low
  pub priority: Option<f64>,
  pub priority_label: Option<String>,
  pub url: Option<String>,
  pub sort_order: Option<f64>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
  pub canceled_at: Option<DateTime<Utc>>,
  pub state: Option<ApiState>,
  pub assignee: Option<ApiUser>,
  #[serde(default)]
  pub labels: ApiLabelConnection,
}

impl ApiUser {
  /// Name to show for the user, preferring the display name.
  pub fn label(&self) -> String {
    self
      .display_name
      .clone()
      .filter(|n| !n.is_empty())
      .or_else(|| self.name.clone())
      .unwrap_or_else(|| self.id.clone())
  }
}
