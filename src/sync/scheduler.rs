//! Periodic sync trigger.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::orchestrator::SyncOrchestrator;
use super::status::{SyncTrigger, TriggerType};

/// Interval used when no schedule is configured or it cannot be parsed.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Longest accepted interval: one week.
pub const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

/// Parse a schedule into a fixed interval.
///
/// Accepted forms: `*/N * * * *`, `@hourly`, `@daily`, or a bare number of
/// minutes. Returns `None` for anything else, including zero or intervals
/// longer than [`MAX_INTERVAL_MINUTES`].
pub fn parse_schedule(schedule: &str) -> Option<Duration> {
  let schedule = schedule.trim();
  let minutes = match schedule {
    "@hourly" => 60,
    "@daily" => 24 * 60,
    _ => {
      if let Ok(n) = schedule.parse::<u64>() {
        n
      } else {
        let fields: Vec<&str> = schedule.split_whitespace().collect();
        match fields.as_slice() {
          [minute, "*", "*", "*", "*"] => minute.strip_prefix("*/")?.parse::<u64>().ok()?,
          _ => return None,
        }
      }
    }
  };

  if minutes == 0 || minutes > MAX_INTERVAL_MINUTES {
    return None;
  }
  minutes.checked_mul(60).map(Duration::from_secs)
}

/// Resolve the configured schedule, falling back to [`DEFAULT_INTERVAL`].
pub fn resolve_interval(schedule: Option<&str>) -> Duration {
  match schedule {
    None => DEFAULT_INTERVAL,
    Some(raw) => parse_schedule(raw).unwrap_or_else(|| {
      warn!(schedule = raw, "Unrecognized sync schedule, using 15 minute interval");
      DEFAULT_INTERVAL
    }),
  }
}

/// Fire a scheduled sync every `period`. The first tick is one period out.
///
/// Ticks that land while a run is in flight are skipped, not queued.
pub async fn run_scheduler(orchestrator: Arc<SyncOrchestrator>, period: Duration) {
  info!(interval_secs = period.as_secs(), "Sync scheduler started");

  let mut ticker = interval_at(Instant::now() + period, period);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

  loop {
    ticker.tick().await;
    let trigger = SyncTrigger::new(TriggerType::Scheduled).with_actor("scheduler");
    if !orchestrator.spawn_sync(trigger) {
      debug!("Scheduled sync skipped, a run is already in progress");
    }
  }
}
