//! Read path: serves listings and details cache-first with live fallbacks.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::storage::IssueCache;
use super::traits::{CacheResult, ItemPage, Pagination};
use crate::error::{ApiErrorCode, UpstreamError};
use crate::sync::orchestrator::SyncOrchestrator;
use crate::sync::status::{SyncTrigger, TriggerType};
use crate::sync::transform::{transform_all, transform_issue, CachedItem};
use crate::upstream::{IssueSource, PageInfo};

/// Cache-first reader over the synced issue set.
///
/// Listings never hit the upstream once a sync has populated the cache.
/// Details go through a short-lived per-item cache before the upstream.
#[derive(Clone)]
pub struct ReadCache {
  cache: Arc<IssueCache>,
  source: Arc<dyn IssueSource>,
  orchestrator: Arc<SyncOrchestrator>,
}

impl ReadCache {
  pub fn new(
    cache: Arc<IssueCache>,
    source: Arc<dyn IssueSource>,
    orchestrator: Arc<SyncOrchestrator>,
  ) -> Self {
    Self {
      cache,
      source,
      orchestrator,
    }
  }

  /// One page of issues.
  ///
  /// With an empty cache this starts a background sync and answers from a
  /// live fetch. If that fails too the answer is an empty page, never an
  /// error.
  pub async fn get_items(&self, pagination: &Pagination) -> CacheResult<ItemPage> {
    let snapshot = self.cache.snapshot();
    if !snapshot.is_empty() {
      let page = snapshot.page(pagination.first, pagination.after.as_deref());
      return CacheResult::from_cache(page, snapshot.synced_at);
    }

    if self.orchestrator.spawn_sync(SyncTrigger::new(TriggerType::CacheMiss)) {
      info!("Cache empty, started background sync");
    }

    match self.fetch_live_page(pagination).await {
      Ok(page) => CacheResult::from_network(page),
      Err(e) => {
        warn!(error_code = e.code(), error = %e, "Live fetch failed with empty cache, serving empty page");
        CacheResult::degraded(ItemPage::empty())
      }
    }
  }

  async fn fetch_live_page(&self, pagination: &Pagination) -> Result<ItemPage, UpstreamError> {
    let team_id = self
      .orchestrator
      .team_id()
      .ok_or_else(|| UpstreamError::Config("upstream.team_id is not set".to_string()))?;

    let page = self
      .source
      .fetch_issues_page(
        team_id,
        pagination.first as u32,
        pagination.after.as_deref(),
      )
      .await?;

    let outcome = transform_all(&page.nodes);
    for failure in &outcome.failures {
      debug!(item_id = %failure.item_id, reason = %failure.reason, "Skipping untransformable issue");
    }

    // The cursor tracks consumed records, including ones that failed to transform.
    let end_cursor = page
      .nodes
      .last()
      .and_then(|node| node.get("id"))
      .and_then(Value::as_str)
      .filter(|id| !id.is_empty())
      .map(String::from)
      .or(page.page_info.end_cursor);
    Ok(ItemPage {
      items: outcome.items,
      page_info: PageInfo {
        has_next_page: page.page_info.has_next_page,
        end_cursor,
      },
    })
  }

  /// A single issue by id.
  ///
  /// `Ok(None)` means the upstream answered "not found"; that answer is never
  /// cached. Upstream failures fall back to the synced list before
  /// surfacing as errors.
  pub async fn get_item_by_id(
    &self,
    id: &str,
  ) -> Result<Option<CacheResult<CachedItem>>, UpstreamError> {
    if let Some(item) = self.cache.get_detail(id) {
      return Ok(Some(CacheResult::from_cache(item, None)));
    }

    let failure = match self.source.fetch_issue(id).await {
      Ok(None) => return Ok(None),
      Ok(Some(raw)) => match transform_issue(&raw) {
        Ok(item) => {
          self.cache.put_detail(id, item.clone());
          return Ok(Some(CacheResult::from_network(item)));
        }
        Err(failure) => UpstreamError::api(
          ApiErrorCode::GraphqlError,
          None,
          format!("Unreadable issue {}: {}", failure.item_id, failure.reason),
        ),
      },
      Err(e) => e,
    };

    let snapshot = self.cache.snapshot();
    match snapshot.find(id) {
      Some(item) => {
        warn!(id, error_code = failure.code(), "Live fetch failed, serving issue from synced list");
        Ok(Some(CacheResult::offline(item.clone(), snapshot.synced_at)))
      }
      None => Err(failure),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::db::NoopRunLog;
  use crate::error::NetworkKind;
  use crate::sync::orchestrator::tests::FakeSource;
  use crate::sync::orchestrator::OrchestratorSettings;
  use crate::sync::transform::tests::{item, raw_issue};
  use crate::sync::SyncState;
  use std::sync::atomic::Ordering;
  use std::time::Duration;

  struct Fixture {
    source: Arc<FakeSource>,
    cache: Arc<IssueCache>,
    orchestrator: Arc<SyncOrchestrator>,
    reader: ReadCache,
  }

  fn fixture(source: FakeSource) -> Fixture {
    let source = Arc::new(source);
    let cache = Arc::new(IssueCache::new(Duration::from_secs(30)));
    let orchestrator = Arc::new(SyncOrchestrator::new(
      source.clone(),
      cache.clone(),
      Arc::new(NoopRunLog),
      OrchestratorSettings {
        team_id: Some("team-1".into()),
        page_size: 10,
        failure_history: 10,
      },
    ));
    let reader = ReadCache::new(cache.clone(), source.clone(), orchestrator.clone());
    Fixture {
      source,
      cache,
      orchestrator,
      reader,
    }
  }

  fn network_down() -> UpstreamError {
    UpstreamError::network(NetworkKind::NetworkError, "connection refused")
  }

  async fn wait_for_sync(orchestrator: &SyncOrchestrator) {
    for _ in 0..100 {
      if !orchestrator.status().is_syncing() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  }

  #[tokio::test]
  async fn populated_cache_serves_pages_without_upstream() {
    let f = fixture(FakeSource::new(vec![]));
    f.cache.replace_all((1..=5).map(|i| item(&format!("id-{}", i), 1, i as f64)).collect());

    let result = f.reader.get_items(&Pagination::new(Some(2), Some("id-2".into()))).await;

    assert_eq!(result.source, CacheSource::Cache);
    assert!(result.cached_at.is_some());
    let ids: Vec<&str> = result.data.items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["id-3", "id-4"]);
    assert!(result.data.page_info.has_next_page);
    assert_eq!(f.source.page_calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn empty_cache_serves_live_and_warms_in_background() {
    let f = fixture(FakeSource::new(vec![
      raw_issue("a", 3, 0.0),
      raw_issue("b", 1, 1.0),
      raw_issue("c", 2, 2.0),
    ]));

    let result = f.reader.get_items(&Pagination::new(Some(2), None)).await;

    assert_eq!(result.source, CacheSource::Network);
    let ids: Vec<&str> = result.data.items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert!(result.data.page_info.has_next_page);
    assert_eq!(result.data.page_info.end_cursor.as_deref(), Some("b"));

    wait_for_sync(&f.orchestrator).await;
    assert_eq!(f.orchestrator.status().status, SyncState::Success);
    assert_eq!(f.cache.len(), 3);

    let cached = f.reader.get_items(&Pagination::new(None, None)).await;
    assert_eq!(cached.source, CacheSource::Cache);
    assert_eq!(cached.data.items[0].id, "b");
  }

  #[tokio::test]
  async fn live_page_cursor_advances_past_untransformable_records() {
    let f = fixture(FakeSource::new(vec![
      serde_json::json!({ "id": "bad-1" }),
      serde_json::json!({ "id": "bad-2" }),
      raw_issue("ok", 1, 0.0),
    ]));

    let first = f.reader.get_items(&Pagination::new(Some(2), None)).await;
    assert_eq!(first.source, CacheSource::Network);
    assert!(first.data.items.is_empty());
    assert!(first.data.page_info.has_next_page);
    assert_eq!(first.data.page_info.end_cursor.as_deref(), Some("bad-2"));
  }

  #[tokio::test]
  async fn empty_cache_and_failed_upstream_degrades_to_empty_page() {
    let f = fixture(FakeSource::failing(network_down()));

    let result = f.reader.get_items(&Pagination::new(None, None)).await;

    assert_eq!(result.source, CacheSource::Degraded);
    assert!(result.data.items.is_empty());
    assert!(!result.data.page_info.has_next_page);

    wait_for_sync(&f.orchestrator).await;
    assert_eq!(f.orchestrator.status().status, SyncState::Error);
  }

  #[tokio::test]
  async fn detail_is_cached_after_first_fetch() {
    let f = fixture(FakeSource::new(vec![raw_issue("a", 1, 0.0)]));

    let first = f.reader.get_item_by_id("a").await.unwrap().unwrap();
    assert_eq!(first.source, CacheSource::Network);

    *f.source.fail_with.lock().unwrap() = Some(network_down());
    let second = f.reader.get_item_by_id("a").await.unwrap().unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data.id, "a");
  }

  #[tokio::test(start_paused = true)]
  async fn detail_cache_expires() {
    let f = fixture(FakeSource::new(vec![raw_issue("a", 1, 0.0)]));
    f.reader.get_item_by_id("a").await.unwrap();

    tokio::time::advance(Duration::from_secs(31)).await;
    let again = f.reader.get_item_by_id("a").await.unwrap().unwrap();
    assert_eq!(again.source, CacheSource::Network);
  }

  #[tokio::test]
  async fn not_found_is_never_cached() {
    let f = fixture(FakeSource::new(vec![]));
    assert!(f.reader.get_item_by_id("late").await.unwrap().is_none());

    f.source.records.lock().unwrap().push(raw_issue("late", 2, 0.0));
    let found = f.reader.get_item_by_id("late").await.unwrap().unwrap();
    assert_eq!(found.data.id, "late");
  }

  #[tokio::test]
  async fn failed_detail_fetch_falls_back_to_synced_list() {
    let f = fixture(FakeSource::failing(network_down()));
    f.cache.replace_all(vec![item("a", 1, 0.0)]);

    let offline = f.reader.get_item_by_id("a").await.unwrap().unwrap();
    assert_eq!(offline.source, CacheSource::Offline);
    assert!(offline.cached_at.is_some());

    let err = f.reader.get_item_by_id("missing").await.unwrap_err();
    assert_eq!(err.code(), "NETWORK_ERROR");
  }
}
