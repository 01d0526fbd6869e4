//! Import core.
//!
//! This module contains:
//! - ContentHasher: streaming SHA-256 content digests
//! - PathPlanner: deterministic payload paths
//! - AtomicWriter: temp-file-then-rename placement
//! - Deduplicator: check-and-reserve per (location, digest)
//! - ImportOrchestrator: batch state machine

pub mod dedup;
pub mod hasher;
pub mod locks;
pub mod orchestrator;
pub mod planner;
pub mod writer;

// Re-export commonly used types
pub use dedup::{CatalogIndex, DedupError, Deduplicator, DigestIndex, ListedDigests, Placement};
pub use hasher::{ContentHasher, HashError, HashedFile};
pub use locks::LocationLocks;
pub use orchestrator::{CancelToken, EventSink, ImportError, ImportOrchestrator, ImportSettings};
pub use writer::{AtomicWriter, PlacedFile, WriteError};
