//! Source intake: what files make up a batch and where batches come from.
//!
//! 1. **Scan**: expands user-supplied files and folders into an ordered list,
//!    skipping OS clutter
//! 2. **Watcher**: turns settled files in a drop folder into import batches
//!
//! ```text
//! drop folder → Watcher → SchedulerHandle::submit_import → ImportOrchestrator
//! ```

pub mod scan;
pub mod watcher;

// Re-export key types
pub use scan::{default_denylist, SourceScanner};
pub use watcher::{DropFolderWatcher, SubmittedDrop, WatchHandle, WatcherConfig, WatcherError};
