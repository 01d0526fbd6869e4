//! Events emitted outward to the UI and catalog hooks.
//!
//! Every import or validation step that observers may care about is
//! published as an immutable [`ArchiveEvent`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::batch::{BatchPhase, BatchSummary, FileOutcome};
use super::integrity::IntegrityCheckResult;
use super::location::LocationId;

/// A single outward event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// What happened
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ArchiveEvent {
    /// Create a new event with the current timestamp
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Dotted event name (`import.progress`, `validation.complete`, ...)
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Location the event concerns
    pub fn location_id(&self) -> &LocationId {
        match &self.kind {
            EventKind::ImportProgress { location_id, .. }
            | EventKind::FileComplete { location_id, .. } => location_id,
            EventKind::BatchComplete(summary) => &summary.location_id,
            EventKind::ValidationComplete(result) => &result.location_id,
        }
    }

    /// Whether this is the last event of an import batch
    pub fn is_batch_terminal(&self) -> bool {
        matches!(self.kind, EventKind::BatchComplete(_))
    }
}

/// Types of events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    /// Batch entered a phase or advanced its durable counter
    ImportProgress {
        batch_id: Uuid,
        location_id: LocationId,
        phase: BatchPhase,
        processed: usize,
        total: usize,
    },

    /// One file reached its final outcome (after cataloging)
    FileComplete {
        batch_id: Uuid,
        location_id: LocationId,
        index: usize,
        outcome: FileOutcome,
    },

    /// Batch finished
    BatchComplete(BatchSummary),

    /// A validation run finished
    ValidationComplete(IntegrityCheckResult),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ImportProgress { .. } => "import.progress",
            EventKind::FileComplete { .. } => "import.fileComplete",
            EventKind::BatchComplete(_) => "import.batchComplete",
            EventKind::ValidationComplete(_) => "validation.complete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CheckLevel, IntegrityStatus};

    #[test]
    fn test_event_names() {
        let location_id = LocationId::derive("Mill", None);
        let progress = ArchiveEvent::new(EventKind::ImportProgress {
            batch_id: Uuid::new_v4(),
            location_id: location_id.clone(),
            phase: BatchPhase::Hashing,
            processed: 0,
            total: 3,
        });
        assert_eq!(progress.name(), "import.progress");
        assert!(!progress.is_batch_terminal());

        let validation = ArchiveEvent::new(EventKind::ValidationComplete(
            IntegrityCheckResult::new(location_id.clone(), IntegrityStatus::Valid, CheckLevel::Full),
        ));
        assert_eq!(validation.name(), "validation.complete");
        assert_eq!(validation.location_id(), &location_id);
    }

    #[test]
    fn test_event_serialization() {
        let event = ArchiveEvent::new(EventKind::ImportProgress {
            batch_id: Uuid::new_v4(),
            location_id: LocationId::derive("Mill", None),
            phase: BatchPhase::Placing,
            processed: 1,
            total: 2,
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"import_progress\""));

        let parsed: ArchiveEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name(), "import.progress");
    }
}
