//! Sync engine: pulls the full issue set upstream and refreshes the cache.

pub mod orchestrator;
pub mod scheduler;
pub mod status;
pub mod transform;

pub use orchestrator::{OrchestratorSettings, RunOutcome, SyncOrchestrator};
pub use status::{SyncState, SyncStatus, SyncTrigger, TriggerType};
pub use transform::{CachedItem, TransformFailure};
