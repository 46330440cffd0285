//! Result types shared by the read path.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::sync::transform::CachedItem;
use crate::upstream::PageInfo;

/// Result from a cache read, including data and metadata about the source.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at,
    }
  }

  /// Cached data served because the network fetch failed.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }

  /// Placeholder answer when neither cache nor network could help.
  pub fn degraded(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Degraded,
      cached_at: None,
    }
  }
}

/// Indicates where read-path data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
  /// Live data from the upstream
  Network,
  /// Served from the in-memory cache
  Cache,
  /// Upstream unavailable, serving cached data
  Offline,
  /// Upstream unavailable and nothing cached
  Degraded,
}

/// One page of cached items.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPage {
  pub items: Vec<CachedItem>,
  pub page_info: PageInfo,
}

impl ItemPage {
  pub fn empty() -> Self {
    Self::default()
  }
}

/// Page request: up to `first` items after the item with id `after`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pagination {
  pub first: usize,
  pub after: Option<String>,
}

impl Pagination {
  pub const DEFAULT_FIRST: usize = 50;
  pub const MAX_FIRST: usize = 250;

  pub fn new(first: Option<usize>, after: Option<String>) -> Self {
    Self {
      first: first
        .unwrap_or(Self::DEFAULT_FIRST)
        .clamp(1, Self::MAX_FIRST),
      after: after.filter(|a| !a.is_empty()),
    }
  }
}
