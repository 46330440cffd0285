//! Composition root: builds every long-lived component once and wires them.

use color_eyre::Result;
use std::sync::Arc;
use tracing::info;

use crate::cache::{IssueCache, ReadCache};
use crate::config::Config;
use crate::db::{RunLog, SqliteRunLog};
use crate::server::{self, AppState};
use crate::sync::scheduler::{resolve_interval, run_scheduler};
use crate::sync::{OrchestratorSettings, SyncOrchestrator, SyncTrigger, TriggerType};
use crate::upstream::rate_limit::RateLimiter;
use crate::upstream::{IssueSource, UpstreamClient};

/// Shared services for one process.
pub struct Services {
  pub config: Config,
  pub run_log: Arc<dyn RunLog>,
  pub cache: Arc<IssueCache>,
  pub orchestrator: Arc<SyncOrchestrator>,
  pub reader: ReadCache,
}

impl Services {
  /// Build against the real upstream and the on-disk run-log.
  pub fn build(config: Config) -> Result<Self> {
    let rate_limiter = Arc::new(RateLimiter::new((&config.rate_limit).into()));
    let client = UpstreamClient::new(&config, rate_limiter)?;
    let run_log = Arc::new(SqliteRunLog::open(config.database.path.as_deref())?);
    Ok(Self::with_source(config, Arc::new(client), run_log))
  }

  pub fn with_source(
    config: Config,
    source: Arc<dyn IssueSource>,
    run_log: Arc<dyn RunLog>,
  ) -> Self {
    let cache = Arc::new(IssueCache::new(config.detail_ttl()));
    let orchestrator = Arc::new(SyncOrchestrator::new(
      Arc::clone(&source),
      Arc::clone(&cache),
      Arc::clone(&run_log),
      OrchestratorSettings {
        team_id: config.upstream.team_id.clone(),
        page_size: config.upstream.page_size,
        failure_history: config.sync.failure_history,
      },
    ));
    let reader = ReadCache::new(Arc::clone(&cache), source, Arc::clone(&orchestrator));

    Self {
      config,
      run_log,
      cache,
      orchestrator,
      reader,
    }
  }

  pub fn app_state(&self) -> AppState {
    AppState::new(
      Arc::clone(&self.orchestrator),
      self.reader.clone(),
      Arc::clone(&self.run_log),
      self.config.sync.trigger_secret.as_deref(),
    )
  }

  /// Start the scheduler, the optional startup sync and the HTTP server.
  /// Returns when the server stops.
  pub async fn serve(self) -> Result<()> {
    if self.config.sync.run_on_startup {
      self
        .orchestrator
        .spawn_sync(SyncTrigger::new(TriggerType::Startup));
    }

    let period = resolve_interval(self.config.sync.schedule.as_deref());
    tokio::spawn(run_scheduler(Arc::clone(&self.orchestrator), period));

    info!(bind = %self.config.server.bind, "Starting issuesync server");
    server::serve(&self.config.server.bind, self.app_state()).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Pagination;
  use crate::db::NoopRunLog;
  use crate::sync::orchestrator::tests::FakeSource;
  use crate::sync::transform::tests::raw_issue;
  use crate::sync::{RunOutcome, SyncState};

  #[tokio::test]
  async fn wires_sync_into_read_path() {
    let config = Config::from_yaml("upstream:\n  team_id: team-1\n  page_size: 1\n").unwrap();
    let source = Arc::new(FakeSource::new(vec![raw_issue("a", 2, 0.0), raw_issue("b", 1, 0.0)]));
    let services = Services::with_source(config, source, Arc::new(NoopRunLog));

    let outcome = services
      .orchestrator
      .run_sync(SyncTrigger::new(TriggerType::Manual))
      .await;
    let RunOutcome::Finished(status) = outcome else {
      panic!("run was skipped");
    };
    assert_eq!(status.status, SyncState::Success);

    let page = services.reader.get_items(&Pagination::new(None, None)).await;
    let ids: Vec<&str> = page.data.items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "a"]);
    assert_eq!(services.cache.len(), 2);
  }

  #[test]
  fn build_fails_fast_without_api_key() {
    std::env::remove_var("ISSUESYNC_API_KEY");
    std::env::remove_var("LINEAR_API_KEY");
    let config = Config::from_yaml("upstream:\n  team_id: team-1\n").unwrap();
    assert!(Services::build(config).is_err());
  }
}
