pub mod backoff;
mod engine;

pub use engine::{SyncEngine, SyncError, SyncReport, SyncTrigger};
