//! In-memory issue storage: the synced list plus a short-lived detail cache.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use super::traits::ItemPage;
use crate::sync::transform::CachedItem;
use crate::upstream::PageInfo;

/// Items from one completed sync run.
#[derive(Debug, Default)]
pub struct CacheSnapshot {
  pub items: Vec<CachedItem>,
  pub synced_at: Option<DateTime<Utc>>,
}

impl CacheSnapshot {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  /// Slice a page using the id of the last item of the previous page as cursor.
  ///
  /// An `after` id that is not in the snapshot yields an empty final page.
  pub fn page(&self, first: usize, after: Option<&str>) -> ItemPage {
    let start = match after {
      None => 0,
      Some(cursor) => match self.items.iter().position(|item| item.id == cursor) {
        Some(index) => index + 1,
        None => return ItemPage::empty(),
      },
    };

    let end = start.saturating_add(first).min(self.items.len());
    let items = self.items[start.min(end)..end].to_vec();

    ItemPage {
      page_info: PageInfo {
        has_next_page: end < self.items.len(),
        end_cursor: items.last().map(|item| item.id.clone()),
      },
      items,
    }
  }

  /// Look up an item by id or human identifier.
  pub fn find(&self, id: &str) -> Option<&CachedItem> {
    self
      .items
      .iter()
      .find(|item| item.id == id || item.identifier.eq_ignore_ascii_case(id))
  }
}

struct DetailEntry {
  item: CachedItem,
  stored_at: Instant,
}

/// Shared issue cache.
///
/// The list is replaced as a whole, never patched, so readers see either the
/// previous run's items or the new run's items and nothing in between.
pub struct IssueCache {
  snapshot: RwLock<Arc<CacheSnapshot>>,
  details: Mutex<HashMap<String, DetailEntry>>,
  detail_ttl: Duration,
}

impl IssueCache {
  pub fn new(detail_ttl: Duration) -> Self {
    Self {
      snapshot: RwLock::new(Arc::new(CacheSnapshot::default())),
      details: Mutex::new(HashMap::new()),
      detail_ttl,
    }
  }

  /// Current list snapshot.
  pub fn snapshot(&self) -> Arc<CacheSnapshot> {
    match self.snapshot.read() {
      Ok(guard) => Arc::clone(&guard),
      Err(poisoned) => Arc::clone(&poisoned.into_inner()),
    }
  }

  pub fn len(&self) -> usize {
    self.snapshot().items.len()
  }

  /// Swap in a new list and drop every detail entry.
  pub fn replace_all(&self, items: Vec<CachedItem>) {
    let next = Arc::new(CacheSnapshot {
      items,
      synced_at: Some(Utc::now()),
    });
    match self.snapshot.write() {
      Ok(mut guard) => *guard = next,
      Err(poisoned) => *poisoned.into_inner() = next,
    }
    self.invalidate_details();
  }

  /// Fresh detail entry, if any. Expired entries are evicted on access.
  pub fn get_detail(&self, id: &str) -> Option<CachedItem> {
    let mut details = self.details.lock().ok()?;
    let entry = details.get(id)?;
    if entry.stored_at.elapsed() < self.detail_ttl {
      return Some(entry.item.clone());
    }
    details.remove(id);
    None
  }

  pub fn put_detail(&self, id: &str, item: CachedItem) {
    if let Ok(mut details) = self.details.lock() {
      details.insert(
        id.to_string(),
        DetailEntry {
          item,
          stored_at: Instant::now(),
        },
      );
    }
  }

  pub fn invalidate_details(&self) {
    if let Ok(mut details) = self.details.lock() {
      details.clear();
    }
  }
}
