use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cursor information for one page of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
  pub has_next_page: bool,
  pub end_cursor: Option<String>,
}

/// One page of raw issue records.
#[derive(Debug, Clone, Default)]
pub struct IssuePage {
  pub nodes: Vec<Value>,
  pub page_info: PageInfo,
}
