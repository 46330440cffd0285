//! In-memory issue cache and the read path built on it.
//!
//! - The synced list is replaced wholesale by each successful sync run
//! - Listings are paged from memory with an id cursor
//! - Details are cached briefly per item; "not found" is never cached
//! - Upstream failures degrade to cached or empty data instead of errors

mod layer;
mod storage;
mod traits;

pub use layer::ReadCache;
pub use storage::{CacheSnapshot, IssueCache};
pub use traits::{CacheResult, CacheSource, ItemPage, Pagination};
