//! Single-flight sync of the full upstream issue set into the cache.
//!
//! A run walks every page of the configured team, transforms each record on
//! its own, and swaps the cache in one assignment. Failed runs leave the
//! previous cache in place.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::status::{SyncState, SyncStatus, SyncTrigger};
use super::transform::{fingerprint, sort_items, transform_all, TransformFailure};
use crate::cache::IssueCache;
use crate::db::{RunCompletion, RunLog};
use crate::error::{scrub_message, ApiErrorCode, SyncError, UpstreamError};
use crate::upstream::IssueSource;

/// Result of asking for a sync run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
  /// Another run was already in flight; nothing happened
  Skipped,
  /// The run finished with this status
  Finished(SyncStatus),
}

/// A run that has claimed the `syncing` slot but not executed yet.
struct RunTicket {
  trigger: SyncTrigger,
  started_at: DateTime<Utc>,
}

struct RunSummary {
  synced: usize,
  failed: usize,
  fingerprint: String,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
  pub team_id: Option<String>,
  pub page_size: u32,
  pub failure_history: usize,
}

impl Default for OrchestratorSettings {
  fn default() -> Self {
    Self {
      team_id: None,
      page_size: 100,
      failure_history: 50,
    }
  }
}

pub struct SyncOrchestrator {
  source: Arc<dyn IssueSource>,
  cache: Arc<IssueCache>,
  run_log: Arc<dyn RunLog>,
  settings: OrchestratorSettings,
  status: Mutex<SyncStatus>,
  failures: Mutex<VecDeque<TransformFailure>>,
}

impl SyncOrchestrator {
  pub fn new(
    source: Arc<dyn IssueSource>,
    cache: Arc<IssueCache>,
    run_log: Arc<dyn RunLog>,
    settings: OrchestratorSettings,
  ) -> Self {
    Self {
      source,
      cache,
      run_log,
      settings,
      status: Mutex::new(SyncStatus::default()),
      failures: Mutex::new(VecDeque::new()),
    }
  }

  pub fn team_id(&self) -> Option<&str> {
    self.settings.team_id.as_deref()
  }

  pub fn status(&self) -> SyncStatus {
    self.lock_status().clone()
  }

  /// Most recent transform failures, oldest first.
  pub fn recent_failures(&self) -> Vec<TransformFailure> {
    match self.failures.lock() {
      Ok(failures) => failures.iter().cloned().collect(),
      Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
    }
  }

  fn lock_status(&self) -> MutexGuard<'_, SyncStatus> {
    match self.status.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Run a full sync and wait for it.
  ///
  /// Returns [`RunOutcome::Skipped`] immediately if a run is already in
  /// flight. Never fails: errors end up in the returned status.
  pub async fn run_sync(&self, trigger: SyncTrigger) -> RunOutcome {
    match self.begin(trigger) {
      Some(ticket) => RunOutcome::Finished(self.execute(ticket).await),
      None => RunOutcome::Skipped,
    }
  }

  /// Start a sync in the background.
  ///
  /// Returns `false` without spawning when a run is already in flight. The
  /// spawned task only logs its outcome; nothing is reported back.
  pub fn spawn_sync(self: &Arc<Self>, trigger: SyncTrigger) -> bool {
    let Some(ticket) = self.begin(trigger) else {
      return false;
    };

    let this = Arc::clone(self);
    tokio::spawn(async move {
      let trigger_type = ticket.trigger.trigger_type;
      let status = this.execute(ticket).await;
      match status.status {
        SyncState::Error => warn!(
          trigger = trigger_type.as_str(),
          error_code = status.error_code.as_deref().unwrap_or_default(),
          "Background sync failed"
        ),
        state => debug!(trigger = trigger_type.as_str(), %state, "Background sync finished"),
      }
    });
    true
  }

  /// Claim the single `syncing` slot. `None` if another run holds it.
  fn begin(&self, trigger: SyncTrigger) -> Option<RunTicket> {
    {
      let mut status = self.lock_status();
      if status.is_syncing() {
        info!(
          trigger = trigger.trigger_type.as_str(),
          "Sync already in progress, ignoring trigger"
        );
        return None;
      }
      status.status = SyncState::Syncing;
      status.error_code = None;
      status.error_message = None;
    }

    Some(RunTicket {
      trigger,
      started_at: Utc::now(),
    })
  }

  /// Record the run start off the async workers. `None` if the log refused it.
  async fn record_start(&self, ticket: &RunTicket) -> Option<i64> {
    let run_log = Arc::clone(&self.run_log);
    let trigger = ticket.trigger.clone();
    let started_at = ticket.started_at;

    match tokio::task::spawn_blocking(move || run_log.start_run(&trigger, started_at)).await {
      Ok(Ok(id)) => Some(id),
      Ok(Err(e)) => {
        warn!(error = %e, "Failed to record sync run start");
        None
      }
      Err(e) => {
        warn!(error = %e, "Run-log task failed while recording run start");
        None
      }
    }
  }

  async fn record_completion(&self, run_id: i64, completion: RunCompletion) {
    let run_log = Arc::clone(&self.run_log);

    match tokio::task::spawn_blocking(move || run_log.complete_run(run_id, &completion)).await {
      Ok(Ok(())) => {}
      Ok(Err(e)) => warn!(run_id, error = %e, "Failed to record sync run completion"),
      Err(e) => warn!(run_id, error = %e, "Run-log task failed while recording run completion"),
    }
  }

  async fn execute(&self, ticket: RunTicket) -> SyncStatus {
    let run_id = self.record_start(&ticket).await;
    info!(
      trigger = ticket.trigger.trigger_type.as_str(),
      actor = ticket.trigger.actor.as_deref().unwrap_or("-"),
      run_id,
      "Sync started"
    );

    let result = match AssertUnwindSafe(self.sync_all()).catch_unwind().await {
      Ok(result) => result,
      Err(panic) => {
        let reason = panic
          .downcast_ref::<&str>()
          .map(|s| s.to_string())
          .or_else(|| panic.downcast_ref::<String>().cloned())
          .unwrap_or_else(|| "panic during sync".to_string());
        Err(SyncError::Internal(reason))
      }
    };

    let finished_at = Utc::now();
    let elapsed_ms = (finished_at - ticket.started_at).num_milliseconds();

    let (status, completion) = {
      let mut status = self.lock_status();
      let completion = match &result {
        Ok(summary) => {
          status.status = if summary.failed > 0 {
            SyncState::Partial
          } else {
            SyncState::Success
          };
          status.last_synced_at = Some(finished_at);
          status.item_count = summary.synced;
          status.items_synced = summary.synced;
          status.items_failed = summary.failed;

          info!(
            run_id,
            synced = summary.synced,
            failed = summary.failed,
            elapsed_ms,
            "Sync completed"
          );

          RunCompletion {
            status: status.status,
            finished_at,
            items_synced: summary.synced,
            items_failed: summary.failed,
            error_code: None,
            error_message: None,
            fingerprint: Some(summary.fingerprint.clone()),
          }
        }
        Err(err) => {
          let failed = match err {
            SyncError::TransformFailed { failed } => *failed,
            _ => 0,
          };
          let message = scrub_message(&err.to_string());
          status.status = SyncState::Error;
          status.item_count = self.cache.len();
          status.items_synced = 0;
          status.items_failed = failed;
          status.error_code = Some(err.code().to_string());
          status.error_message = Some(message.clone());

          error!(
            run_id,
            trigger = ticket.trigger.trigger_type.as_str(),
            error_code = err.code(),
            error = %message,
            elapsed_ms,
            "Sync failed, keeping previous cache"
          );

          RunCompletion {
            status: SyncState::Error,
            finished_at,
            items_synced: 0,
            items_failed: failed,
            error_code: Some(err.code().to_string()),
            error_message: Some(message),
            fingerprint: None,
          }
        }
      };
      (status.clone(), completion)
    };

    if let Some(run_id) = run_id {
      self.record_completion(run_id, completion).await;
    }

    status
  }

  async fn sync_all(&self) -> Result<RunSummary, SyncError> {
    let team_id = self
      .settings
      .team_id
      .as_deref()
      .filter(|id| !id.trim().is_empty())
      .ok_or_else(|| SyncError::Config("upstream.team_id is not set".to_string()))?;

    let raw = self.fetch_all(team_id).await?;
    let outcome = transform_all(&raw);
    let failed = outcome.failures.len();

    for failure in &outcome.failures {
      warn!(item_id = %failure.item_id, reason = %failure.reason, "Failed to transform issue");
    }
    self.remember_failures(outcome.failures);

    if outcome.items.is_empty() && failed > 0 {
      return Err(SyncError::TransformFailed { failed });
    }

    let sorted = sort_items(&outcome.items);
    let summary = RunSummary {
      synced: sorted.len(),
      failed,
      fingerprint: fingerprint(&sorted),
    };
    self.cache.replace_all(sorted);

    Ok(summary)
  }

  /// Walk every page of the team's issues.
  async fn fetch_all(&self, team_id: &str) -> Result<Vec<Value>, UpstreamError> {
    let mut records = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0u32;

    loop {
      let page = self
        .source
        .fetch_issues_page(team_id, self.settings.page_size, cursor.as_deref())
        .await?;
      pages += 1;
      debug!(page = pages, records = page.nodes.len(), "Fetched issue page");
      records.extend(page.nodes);

      if !page.page_info.has_next_page {
        break;
      }

      match page.page_info.end_cursor {
        Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
        _ => {
          return Err(UpstreamError::api(
            ApiErrorCode::GraphqlError,
            None,
            format!("Pagination cursor did not advance after page {}", pages),
          ))
        }
      }
    }

    info!(pages, records = records.len(), "Fetched all issues");
    Ok(records)
  }

  fn remember_failures(&self, new_failures: Vec<TransformFailure>) {
    let limit = self.settings.failure_history;
    let mut failures = match self.failures.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    failures.extend(new_failures);
    while failures.len() > limit {
      failures.pop_front();
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::db::{NoopRunLog, SqliteRunLog};
  use crate::error::NetworkKind;
  use crate::sync::status::TriggerType;
  use crate::sync::transform::tests::raw_issue;
  use crate::upstream::{IssuePage, PageInfo};
  use async_trait::async_trait;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;
  use tokio::sync::Notify;

  /// In-process upstream serving fixed records in pages.
  pub(crate) struct FakeSource {
    pub records: Mutex<Vec<Value>>,
    pub fail_with: Mutex<Option<UpstreamError>>,
    pub page_calls: AtomicUsize,
    pub gate: Option<Arc<Notify>>,
  }

  impl FakeSource {
    pub(crate) fn new(records: Vec<Value>) -> Self {
      Self {
        records: Mutex::new(records),
        fail_with: Mutex::new(None),
        page_calls: AtomicUsize::new(0),
        gate: None,
      }
    }

    pub(crate) fn failing(err: UpstreamError) -> Self {
      let source = Self::new(Vec::new());
      *source.fail_with.lock().unwrap() = Some(err);
      source
    }
  }

  #[async_trait]
  impl IssueSource for FakeSource {
    async fn fetch_issues_page(
      &self,
      _team_id: &str,
      first: u32,
      after: Option<&str>,
    ) -> Result<IssuePage, UpstreamError> {
      self.page_calls.fetch_add(1, Ordering::SeqCst);
      if let Some(gate) = &self.gate {
        gate.notified().await;
      }
      if let Some(err) = self.fail_with.lock().unwrap().clone() {
        return Err(err);
      }

      let records = self.records.lock().unwrap().clone();
      let start = match after {
        Some(cursor) => cursor.parse::<usize>().unwrap(),
        None => 0,
      };
      let end = (start + first as usize).min(records.len());
      Ok(IssuePage {
        nodes: records[start..end].to_vec(),
        page_info: PageInfo {
          has_next_page: end < records.len(),
          end_cursor: Some(end.to_string()),
        },
      })
    }

    async fn fetch_issue(&self, id: &str) -> Result<Option<Value>, UpstreamError> {
      if let Some(err) = self.fail_with.lock().unwrap().clone() {
        return Err(err);
      }
      let records = self.records.lock().unwrap();
      Ok(records.iter().find(|r| r["id"] == id).cloned())
    }
  }

  fn settings(page_size: u32) -> OrchestratorSettings {
    OrchestratorSettings {
      team_id: Some("team-1".into()),
      page_size,
      failure_history: 5,
    }
  }

  fn orchestrator(source: Arc<FakeSource>, cache: Arc<IssueCache>) -> SyncOrchestrator {
    SyncOrchestrator::new(source, cache, Arc::new(NoopRunLog), settings(2))
  }

  fn new_cache() -> Arc<IssueCache> {
    Arc::new(IssueCache::new(Duration::from_secs(30)))
  }

  fn records(n: usize) -> Vec<Value> {
    (0..n)
      .map(|i| raw_issue(&format!("issue-{}", i), (i % 5) as u8, i as f64))
      .collect()
  }

  fn broken(id: &str) -> Value {
    json!({ "id": id, "title": "no identifier or timestamps" })
  }

  fn manual() -> SyncTrigger {
    SyncTrigger::new(TriggerType::Manual)
  }

  fn finished(outcome: RunOutcome) -> SyncStatus {
    match outcome {
      RunOutcome::Finished(status) => status,
      RunOutcome::Skipped => panic!("run was skipped"),
    }
  }

  #[tokio::test]
  async fn full_sync_paginates_and_sorts() {
    let source = Arc::new(FakeSource::new(records(7)));
    let cache = new_cache();
    let sync = orchestrator(source.clone(), cache.clone());

    let status = finished(sync.run_sync(manual()).await);

    assert_eq!(status.status, SyncState::Success);
    assert_eq!(status.items_synced, 7);
    assert_eq!(status.items_failed, 0);
    assert_eq!(status.item_count, 7);
    assert!(status.last_synced_at.is_some());
    assert_eq!(source.page_calls.load(Ordering::SeqCst), 4);

    let priorities: Vec<u8> = cache.snapshot().items.iter().map(|i| i.priority).collect();
    assert_eq!(priorities, vec![1, 1, 2, 3, 4, 0, 0]);
  }

  #[tokio::test]
  async fn partial_failure_caches_successes() {
    let mut raw = records(4);
    raw.push(broken("bad-1"));
    raw.push(broken("bad-2"));
    let source = Arc::new(FakeSource::new(raw));
    let cache = new_cache();
    let sync = orchestrator(source, cache.clone());

    let status = finished(sync.run_sync(manual()).await);

    assert_eq!(status.status, SyncState::Partial);
    assert_eq!(status.items_synced, 4);
    assert_eq!(status.items_failed, 2);
    assert_eq!(cache.len(), 4);
    let failed_ids: Vec<String> = sync.recent_failures().into_iter().map(|f| f.item_id).collect();
    assert_eq!(failed_ids, vec!["bad-1", "bad-2"]);
  }

  #[tokio::test]
  async fn total_transform_failure_keeps_previous_cache() {
    let source = Arc::new(FakeSource::new(records(3)));
    let cache = new_cache();
    let sync = orchestrator(source.clone(), cache.clone());
    finished(sync.run_sync(manual()).await);
    let before = cache.snapshot();

    *source.records.lock().unwrap() = vec![broken("a"), broken("b"), broken("c"), broken("d")];
    let status = finished(sync.run_sync(manual()).await);

    assert_eq!(status.status, SyncState::Error);
    assert_eq!(status.error_code.as_deref(), Some("TRANSFORM_FAILED"));
    assert_eq!(status.items_failed, 4);
    assert_eq!(status.item_count, 3);
    assert!(Arc::ptr_eq(&before, &cache.snapshot()));
  }

  #[tokio::test]
  async fn fetch_failure_keeps_previous_cache_with_classified_code() {
    let source = Arc::new(FakeSource::new(records(3)));
    let cache = new_cache();
    let sync = orchestrator(source.clone(), cache.clone());
    let first = finished(sync.run_sync(manual()).await);

    *source.fail_with.lock().unwrap() = Some(UpstreamError::network(
      NetworkKind::Timeout,
      "timed out, Authorization: lin_api_supersecret",
    ));
    let status = finished(sync.run_sync(manual()).await);

    assert_eq!(status.status, SyncState::Error);
    assert_eq!(status.error_code.as_deref(), Some("TIMEOUT"));
    assert!(!status.error_message.unwrap().contains("supersecret"));
    assert_eq!(status.last_synced_at, first.last_synced_at);
    assert_eq!(cache.len(), 3);
  }

  #[tokio::test]
  async fn missing_team_is_a_config_error() {
    let source = Arc::new(FakeSource::new(records(3)));
    let sync = SyncOrchestrator::new(
      source.clone(),
      new_cache(),
      Arc::new(NoopRunLog),
      OrchestratorSettings::default(),
    );

    let status = finished(sync.run_sync(manual()).await);
    assert_eq!(status.error_code.as_deref(), Some("SYNC_CONFIG_ERROR"));
    assert_eq!(source.page_calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn stuck_cursor_is_an_error() {
    struct StuckSource;

    #[async_trait]
    impl IssueSource for StuckSource {
      async fn fetch_issues_page(
        &self,
        _team_id: &str,
        _first: u32,
        _after: Option<&str>,
      ) -> Result<IssuePage, UpstreamError> {
        Ok(IssuePage {
          nodes: vec![raw_issue("x", 1, 0.0)],
          page_info: PageInfo {
            has_next_page: true,
            end_cursor: Some("same".into()),
          },
        })
      }

      async fn fetch_issue(&self, _id: &str) -> Result<Option<Value>, UpstreamError> {
        Ok(None)
      }
    }

    let sync = SyncOrchestrator::new(
      Arc::new(StuckSource),
      new_cache(),
      Arc::new(NoopRunLog),
      settings(1),
    );
    let status = finished(sync.run_sync(manual()).await);
    assert_eq!(status.error_code.as_deref(), Some("GRAPHQL_ERROR"));
  }

  #[tokio::test]
  async fn concurrent_run_is_skipped() {
    let gate = Arc::new(Notify::new());
    let mut source = FakeSource::new(records(1));
    source.gate = Some(gate.clone());
    let source = Arc::new(source);
    let sync = Arc::new(orchestrator(source.clone(), new_cache()));

    let running = {
      let sync = Arc::clone(&sync);
      tokio::spawn(async move { sync.run_sync(manual()).await })
    };
    while source.page_calls.load(Ordering::SeqCst) == 0 {
      tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let during = sync.status();
    assert_eq!(during.status, SyncState::Syncing);
    assert_eq!(sync.run_sync(manual()).await, RunOutcome::Skipped);
    assert!(!sync.spawn_sync(manual()));
    assert_eq!(sync.status(), during);
    assert_eq!(source.page_calls.load(Ordering::SeqCst), 1);

    gate.notify_one();
    let status = finished(running.await.unwrap());
    assert_eq!(status.status, SyncState::Success);

    // Slot is free again once the run ends.
    gate.notify_one();
    assert!(matches!(sync.run_sync(manual()).await, RunOutcome::Finished(_)));
  }

  #[tokio::test]
  async fn slow_run_log_does_not_stall_other_tasks() {
    struct SlowLog;

    impl RunLog for SlowLog {
      fn start_run(&self, _: &SyncTrigger, _: DateTime<Utc>) -> color_eyre::Result<i64> {
        std::thread::sleep(Duration::from_millis(500));
        Ok(1)
      }
      fn complete_run(&self, _: i64, _: &RunCompletion) -> color_eyre::Result<()> {
        Ok(())
      }
      fn recent_runs(&self, _: usize) -> color_eyre::Result<Vec<crate::db::SyncRunEntry>> {
        Ok(Vec::new())
      }
    }

    let sync = Arc::new(SyncOrchestrator::new(
      Arc::new(FakeSource::new(records(2))),
      new_cache(),
      Arc::new(SlowLog),
      settings(10),
    ));
    assert!(sync.spawn_sync(manual()));

    let started = std::time::Instant::now();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(started.elapsed() < Duration::from_millis(300));
    assert!(sync.status().is_syncing());

    for _ in 0..200 {
      if !sync.status().is_syncing() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sync.status().status, SyncState::Success);
  }

  #[tokio::test]
  async fn spawn_sync_runs_in_background() {
    let source = Arc::new(FakeSource::new(records(3)));
    let cache = new_cache();
    let sync = Arc::new(orchestrator(source, cache.clone()));

    assert!(sync.spawn_sync(SyncTrigger::new(TriggerType::CacheMiss)));
    for _ in 0..100 {
      if !sync.status().is_syncing() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(sync.status().status, SyncState::Success);
    assert_eq!(cache.len(), 3);
  }

  #[tokio::test]
  async fn failure_history_is_bounded() {
    let raw: Vec<Value> = (0..8).map(|i| broken(&format!("bad-{}", i))).collect();
    let mut with_good = raw.clone();
    with_good.push(raw_issue("good", 1, 0.0));
    let sync = orchestrator(Arc::new(FakeSource::new(with_good)), new_cache());

    finished(sync.run_sync(manual()).await);
    let failures = sync.recent_failures();
    assert_eq!(failures.len(), 5);
    assert_eq!(failures[0].item_id, "bad-3");
    assert_eq!(failures[4].item_id, "bad-7");
  }

  #[tokio::test]
  async fn run_log_records_every_run() {
    let log = Arc::new(SqliteRunLog::open_in_memory().unwrap());
    let source = Arc::new(FakeSource::new(records(3)));
    let sync = SyncOrchestrator::new(source.clone(), new_cache(), log.clone(), settings(10));

    finished(sync.run_sync(SyncTrigger::new(TriggerType::Scheduled).with_actor("scheduler")).await);
    *source.fail_with.lock().unwrap() = Some(UpstreamError::api(
      ApiErrorCode::AuthenticationError,
      Some(401),
      "bad key",
    ));
    finished(sync.run_sync(manual()).await);

    let runs = log.recent_runs(10).unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].status, SyncState::Error);
    assert_eq!(runs[0].error_code.as_deref(), Some("AUTHENTICATION_ERROR"));
    assert_eq!(runs[1].status, SyncState::Success);
    assert_eq!(runs[1].items_synced, 3);
    assert_eq!(runs[1].triggered_by.as_deref(), Some("scheduler"));
    assert!(runs[1].fingerprint.is_some());
  }

  #[tokio::test]
  async fn run_log_failures_never_fail_the_sync() {
    struct BrokenLog;

    impl RunLog for BrokenLog {
      fn start_run(&self, _: &SyncTrigger, _: DateTime<Utc>) -> color_eyre::Result<i64> {
        Err(color_eyre::eyre::eyre!("disk full"))
      }
      fn complete_run(&self, _: i64, _: &RunCompletion) -> color_eyre::Result<()> {
        Err(color_eyre::eyre::eyre!("disk full"))
      }
      fn recent_runs(&self, _: usize) -> color_eyre::Result<Vec<crate::db::SyncRunEntry>> {
        Ok(Vec::new())
      }
    }

    let cache = new_cache();
    let sync = SyncOrchestrator::new(
      Arc::new(FakeSource::new(records(2))),
      cache.clone(),
      Arc::new(BrokenLog),
      settings(10),
    );
    let status = finished(sync.run_sync(manual()).await);
    assert_eq!(status.status, SyncState::Success);
    assert_eq!(cache.len(), 2);
  }
}
