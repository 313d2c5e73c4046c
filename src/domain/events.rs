//! Event Records
//!
//! Append-only records written to the event/audit log: mode transitions,
//! per-backend health samples, and template lifecycle events. All records
//! are immutable once written; retention is an operational concern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::ports::StorageMode;

// =============================================================================
// Mode Transitions
// =============================================================================

/// What caused a mode transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionTrigger {
    /// Computed by the periodic probe cycle
    Auto,
    /// Operator escape hatch (`force_mode`)
    Manual,
}

impl std::fmt::Display for TransitionTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionTrigger::Auto => write!(f, "auto"),
            TransitionTrigger::Manual => write!(f, "manual"),
        }
    }
}

/// Record of a storage mode change. Written whenever the computed mode
/// differs from the previously held mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeTransition {
    pub from_mode: StorageMode,
    pub to_mode: StorageMode,
    pub trigger: TransitionTrigger,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
    pub success: bool,
}

impl ModeTransition {
    /// Create an automatic transition record.
    pub fn auto(from: StorageMode, to: StorageMode, reason: impl Into<String>) -> Self {
        Self {
            from_mode: from,
            to_mode: to,
            trigger: TransitionTrigger::Auto,
            reason: reason.into(),
            occurred_at: Utc::now(),
            success: true,
        }
    }

    /// Create a manual (operator-forced) transition record.
    pub fn manual(from: StorageMode, to: StorageMode, reason: impl Into<String>) -> Self {
        Self {
            from_mode: from,
            to_mode: to,
            trigger: TransitionTrigger::Manual,
            reason: reason.into(),
            occurred_at: Utc::now(),
            success: true,
        }
    }
}

// =============================================================================
// Health Samples
// =============================================================================

/// One probe observation for a single backend. Produced every probe cycle
/// for observability, regardless of whether the mode changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    pub backend: String,
    pub available: bool,
    pub latency_ms: Option<u64>,
    pub free_space_bytes: Option<u64>,
    pub checked_at: DateTime<Utc>,
}

impl HealthSample {
    /// Sample for a backend that answered its probe.
    pub fn available(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            available: true,
            latency_ms: None,
            free_space_bytes: None,
            checked_at: Utc::now(),
        }
    }

    /// Sample for a backend that failed or timed out.
    pub fn unavailable(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            available: false,
            latency_ms: None,
            free_space_bytes: None,
            checked_at: Utc::now(),
        }
    }

    /// Attach a measured probe latency.
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    /// Attach a best-effort free-space measurement.
    pub fn with_free_space(mut self, free_space_bytes: Option<u64>) -> Self {
        self.free_space_bytes = free_space_bytes;
        self
    }
}

// =============================================================================
// Template Lifecycle Events
// =============================================================================

/// Template lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateEventKind {
    TemplateCreated,
    TemplateUpdated,
    TemplateLoaded,
    TemplateDeleted,
}

impl std::fmt::Display for TemplateEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateEventKind::TemplateCreated => write!(f, "TEMPLATE_CREATED"),
            TemplateEventKind::TemplateUpdated => write!(f, "TEMPLATE_UPDATED"),
            TemplateEventKind::TemplateLoaded => write!(f, "TEMPLATE_LOADED"),
            TemplateEventKind::TemplateDeleted => write!(f, "TEMPLATE_DELETED"),
        }
    }
}

/// Audit record of a template lifecycle operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateEvent {
    pub kind: TemplateEventKind,
    pub template_id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub version: u32,
    pub storage_mode: StorageMode,
    pub occurred_at: DateTime<Utc>,
}

impl TemplateEvent {
    pub fn new(
        kind: TemplateEventKind,
        template_id: Uuid,
        owner_id: impl Into<String>,
        name: impl Into<String>,
        version: u32,
        storage_mode: StorageMode,
    ) -> Self {
        Self {
            kind,
            template_id,
            owner_id: owner_id.into(),
            name: name.into(),
            version,
            storage_mode,
            occurred_at: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_builders() {
        let auto = ModeTransition::auto(StorageMode::Full, StorageMode::Fallback, "obj down");
        assert_eq!(auto.trigger, TransitionTrigger::Auto);
        assert!(auto.success);

        let manual = ModeTransition::manual(StorageMode::Fallback, StorageMode::Full, "ops");
        assert_eq!(manual.trigger, TransitionTrigger::Manual);
        assert_eq!(manual.from_mode, StorageMode::Fallback);
        assert_eq!(manual.to_mode, StorageMode::Full);
    }

    #[test]
    fn test_transition_serialization() {
        let t = ModeTransition::auto(StorageMode::Full, StorageMode::LocalOnly, "db down");
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("\"auto\""));
        assert!(json.contains("\"local_only\""));

        let back: ModeTransition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_health_sample_builders() {
        let sample = HealthSample::available("object-store")
            .with_latency(12)
            .with_free_space(Some(1024));
        assert!(sample.available);
        assert_eq!(sample.latency_ms, Some(12));
        assert_eq!(sample.free_space_bytes, Some(1024));

        let down = HealthSample::unavailable("metadata-store");
        assert!(!down.available);
        assert!(down.latency_ms.is_none());
    }

    #[test]
    fn test_template_event_kind_wire_format() {
        let event = TemplateEvent::new(
            TemplateEventKind::TemplateCreated,
            Uuid::new_v4(),
            "u1",
            "Card A",
            1,
            StorageMode::Full,
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("TEMPLATE_CREATED"));
        assert_eq!(TemplateEventKind::TemplateDeleted.to_string(), "TEMPLATE_DELETED");
    }
}
