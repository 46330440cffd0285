use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Visible state of the sync state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
  #[default]
  Idle,
  Syncing,
  Success,
  Error,
  Partial,
}

impl SyncState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Idle => "idle",
      Self::Syncing => "syncing",
      Self::Success => "success",
      Self::Error => "error",
      Self::Partial => "partial",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "idle" => Some(Self::Idle),
      "syncing" => Some(Self::Syncing),
      "success" => Some(Self::Success),
      "error" => Some(Self::Error),
      "partial" => Some(Self::Partial),
      _ => None,
    }
  }
}

impl fmt::Display for SyncState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Process-wide sync status. Only the orchestrator mutates it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
  pub status: SyncState,
  pub last_synced_at: Option<DateTime<Utc>>,
  /// Items currently held by the cache
  pub item_count: usize,
  pub items_synced: usize,
  pub items_failed: usize,
  pub error_code: Option<String>,
  pub error_message: Option<String>,
}

impl SyncStatus {
  pub fn is_syncing(&self) -> bool {
    self.status == SyncState::Syncing
  }
}

/// What started a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
  Manual,
  Scheduled,
  Startup,
  /// Background warm-up started by a read that found the cache empty
  CacheMiss,
}

impl TriggerType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Manual => "manual",
      Self::Scheduled => "scheduled",
      Self::Startup => "startup",
      Self::CacheMiss => "cache_miss",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTrigger {
  pub trigger_type: TriggerType,
  pub actor: Option<String>,
}

impl SyncTrigger {
  pub fn new(trigger_type: TriggerType) -> Self {
    Self {
      trigger_type,
      actor: None,
    }
  }

  pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
    self.actor = Some(actor.into());
    self
  }
}
