//! Projection of raw upstream records into cacheable items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

use crate::upstream::api_types::ApiIssue;

/// Flattened, JSON-safe projection of an upstream issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedItem {
  pub id: String,
  pub identifier: String,
  pub title: String,
  pub description: Option<String>,
  /// 0 = none, 1 = urgent .. 4 = low
  pub priority: u8,
  pub priority_label: String,
  pub status: String,
  pub status_type: String,
  pub status_color: Option<String>,
  pub assignee: Option<String>,
  pub assignee_id: Option<String>,
  pub labels: Vec<String>,
  pub url: Option<String>,
  pub sort_order: f64,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
  pub canceled_at: Option<DateTime<Utc>>,
}

/// A record that could not be projected into a [`CachedItem`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformFailure {
  pub item_id: String,
  pub reason: String,
}

/// Result of transforming a batch; every input lands in exactly one list.
#[derive(Debug, Default)]
pub struct TransformOutcome {
  pub items: Vec<CachedItem>,
  pub failures: Vec<TransformFailure>,
}

const UNKNOWN_ID: &str = "<unknown>";

pub fn priority_label(priority: u8) -> &'static str {
  match priority {
    1 => "Urgent",
    2 => "High",
    3 => "Medium",
    4 => "Low",
    _ => "No priority",
  }
}

/// Project one raw record.
pub fn transform_issue(raw: &Value) -> Result<CachedItem, TransformFailure> {
  let item_id = raw
    .get("id")
    .and_then(Value::as_str)
    .filter(|id| !id.is_empty())
    .unwrap_or(UNKNOWN_ID)
    .to_string();
  let fail = |reason: String| TransformFailure {
    item_id: item_id.clone(),
    reason,
  };

  let issue: ApiIssue = serde_json::from_value(raw.clone()).map_err(|e| fail(e.to_string()))?;

  if issue.id.trim().is_empty() {
    return Err(fail("missing id".to_string()));
  }
  if issue.identifier.trim().is_empty() {
    return Err(fail("missing identifier".to_string()));
  }

  let priority = match issue.priority {
    None => 0,
    Some(p) if p.fract() == 0.0 && (0.0..=4.0).contains(&p) => p as u8,
    Some(p) => return Err(fail(format!("priority out of range: {}", p))),
  };
  let sort_order = issue.sort_order.filter(|s| s.is_finite()).unwrap_or(0.0);

  let (status, status_type, status_color) = match issue.state {
    Some(state) => (state.name, state.state_type, state.color),
    None => (String::new(), String::new(), None),
  };

  Ok(CachedItem {
    priority_label: issue
      .priority_label
      .filter(|l| !l.is_empty())
      .unwrap_or_else(|| priority_label(priority).to_string()),
    assignee: issue.assignee.as_ref().map(|u| u.label()),
    assignee_id: issue.assignee.map(|u| u.id),
    labels: issue.labels.nodes.into_iter().map(|l| l.name).collect(),
    id: issue.id,
    identifier: issue.identifier,
    title: issue.title,
    description: issue.description,
    priority,
    status,
    status_type,
    status_color,
    url: issue.url,
    sort_order,
    created_at: issue.created_at,
    updated_at: issue.updated_at,
    completed_at: issue.completed_at,
    canceled_at: issue.canceled_at,
  })
}

/// Transform every record independently; one bad record never aborts the batch.
pub fn transform_all(raw: &[Value]) -> TransformOutcome {
  let mut outcome = TransformOutcome::default();
  for record in raw {
    match transform_issue(record) {
      Ok(item) => outcome.items.push(item),
      Err(failure) => outcome.failures.push(failure),
    }
  }
  outcome
}

/// Rank used for ordering: urgent first, "no priority" after low.
fn priority_rank(priority: u8) -> u8 {
  if priority == 0 {
    u8::MAX
  } else {
    priority
  }
}

fn compare_items(a: &CachedItem, b: &CachedItem) -> Ordering {
  priority_rank(a.priority)
    .cmp(&priority_rank(b.priority))
    .then_with(|| a.sort_order.total_cmp(&b.sort_order))
}

/// Return a sorted copy: priority ascending with 0 last, then sort order.
/// The input is left untouched.
pub fn sort_items(items: &[CachedItem]) -> Vec<CachedItem> {
  let mut sorted = items.to_vec();
  sorted.sort_by(compare_items);
  sorted
}

/// Stable digest of the cached set, used to tell whether two runs differ.
pub fn fingerprint(items: &[CachedItem]) -> String {
  let mut hasher = Sha256::new();
  for item in items {
    hasher.update(item.id.as_bytes());
    hasher.update(b"\0");
    hasher.update(item.updated_at.timestamp_millis().to_be_bytes());
    hasher.update(b"\n");
  }
  hex::encode(hasher.finalize())
}
